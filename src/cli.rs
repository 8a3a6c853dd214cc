//! # Command-Line Interface Module
//!
//! Argument parsing for the three run modes, built on the `clap` derive API.
//! The logging flags are global so they sit in front of or behind the
//! subcommand; everything else is per mode.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Direct proxy: every switch gets a session to both controllers
//! ofmux direct --controller 10.0.3.7:6633 --controller 10.0.3.254:6633
//!
//! # Edge proxy toward two tunnels, weighted scheduling, capture enabled
//! ofmux edge -v --tunnel 10.0.3.7:9999@2 --tunnel 10.0.3.254:9999 \
//!     --policy weighted --capture log.bin
//!
//! # Tunnel process in front of a local controller
//! ofmux tunnel --controller 127.0.0.1:6633
//! ```

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, Subcommand,
};
use std::path::PathBuf;
use std::time::Duration;

use crate::mux::scheduler::Policy;
use crate::mux::service::{ProxyConfig, Upstream};
use crate::mux::LegFraming;
use crate::tunnel::TunnelConfig;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    #[command(subcommand)]
    pub mode: RunMode,

    /// Increase diagnostic log verbosity.
    ///
    /// Can be used multiple times: the default is INFO, -v is DEBUG,
    /// -vv and more is TRACE.
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Silence the user-facing output on stdout.
    ///
    /// Only the detailed log (file or stderr) remains active. Useful when
    /// the proxy runs under a supervisor that captures the log file anyway.
    #[arg(short = 'q', long, global = true, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Detailed log destination: a file path, or "stderr".
    ///
    /// File logs rotate daily. Defaults to ofmux.log in the working
    /// directory.
    #[arg(long, global = true, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

/// The three operational variants sharing one core engine.
#[derive(Subcommand, Debug, Clone)]
pub enum RunMode {
    /// Proxy switches straight to a pool of controllers.
    ///
    /// Every switch that completes its HELLO gets one dedicated session per
    /// configured controller; the proxy multiplexes commands down and fans
    /// events back out preserving request/reply correlation and role
    /// semantics.
    Direct(DirectArgs),

    /// Proxy switches to tunnel processes over envelope-framed pipes.
    ///
    /// The tunnel connections are shared by all switches; each message
    /// crossing them carries a `(dpid, length)` envelope so one TCP pipe
    /// can serve the whole switch population.
    Edge(EdgeArgs),

    /// Terminate an envelope pipe in front of a controller.
    ///
    /// Accepts a single upstream connection from an edge proxy and keeps
    /// one controller session per datapath id.
    Tunnel(TunnelArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct DirectArgs {
    /// Switch-edge listen address.
    #[arg(long, default_value_t = format!("0.0.0.0:{}", crate::defaults::SWITCH_PORT))]
    pub listen: String,

    /// Controller endpoint as host:port, with an optional @weight suffix
    /// for the weighted policy. Repeat for each controller.
    #[arg(long = "controller", required = true, value_name = "HOST:PORT[@W]")]
    pub controllers: Vec<Upstream>,

    /// PACKET_IN scheduling policy.
    #[arg(long, value_enum, default_value_t = Policy::RoundRobin)]
    pub policy: Policy,

    /// Append forwarded PACKET_IN and received PACKET_OUT messages to this
    /// capture file for off-line latency analysis.
    #[arg(long)]
    pub capture: Option<PathBuf>,

    /// Keepalive ECHO_REQUEST period on controller sessions.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub echo_interval: Duration,
}

#[derive(clap::Args, Debug, Clone)]
pub struct EdgeArgs {
    /// Switch-edge listen address.
    #[arg(long, default_value_t = format!("0.0.0.0:{}", crate::defaults::SWITCH_PORT))]
    pub listen: String,

    /// Tunnel endpoint as host:port, with an optional @weight suffix for
    /// the weighted policy. Repeat for each tunnel.
    #[arg(long = "tunnel", required = true, value_name = "HOST:PORT[@W]")]
    pub tunnels: Vec<Upstream>,

    /// PACKET_IN scheduling policy.
    #[arg(long, value_enum, default_value_t = Policy::RoundRobin)]
    pub policy: Policy,

    /// Append forwarded PACKET_IN and received PACKET_OUT messages to this
    /// capture file for off-line latency analysis.
    #[arg(long)]
    pub capture: Option<PathBuf>,

    /// Keepalive ECHO_REQUEST period on dialed legs.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub echo_interval: Duration,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TunnelArgs {
    /// Upstream-edge listen address for the envelope pipe.
    #[arg(long, default_value_t = format!("0.0.0.0:{}", crate::defaults::TUNNEL_PORT))]
    pub listen: String,

    /// Controller endpoint dialed once per datapath id.
    #[arg(long, default_value_t = format!("127.0.0.1:{}", crate::defaults::CONTROLLER_PORT))]
    pub controller: String,

    /// Keepalive ECHO_REQUEST period on controller sessions.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub echo_interval: Duration,
}

impl DirectArgs {
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            listen: self.listen.clone(),
            upstreams: self.controllers.clone(),
            leg_framing: LegFraming::Plain,
            policy: self.policy,
            echo_interval: self.echo_interval,
            capture: self.capture.clone(),
        }
    }
}

impl EdgeArgs {
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            listen: self.listen.clone(),
            upstreams: self.tunnels.clone(),
            leg_framing: LegFraming::Envelope,
            policy: self.policy,
            echo_interval: self.echo_interval,
            capture: self.capture.clone(),
        }
    }
}

impl TunnelArgs {
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            listen: self.listen.clone(),
            controller: self.controller.clone(),
            echo_interval: self.echo_interval,
        }
    }
}

/// Parse a duration from a string like "500ms", "10s", "5m" or "1h".
///
/// A bare number is taken as seconds. Fractional values are accepted.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {}", num_str))?;
    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    let duration = match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("invalid duration unit: {}", unit)),
    };
    Ok(duration)
}
