//! # OFMux - Main Entry Point
//!
//! Assembles the logging stack, parses the command line and drives the
//! selected run mode until a fatal condition surfaces.
//!
//! ## Logging layout
//!
//! Two layers:
//!
//! - A detailed layer writing to a daily-rotated log file (or stderr when
//!   `--log-file stderr`), always on, verbosity from `-v` flags.
//! - A clean colorized stdout layer for a human operator, suppressed by
//!   `--quiet`.
//!
//! ## Exit behavior
//!
//! The service form never stops cleanly; any fatal condition (framing
//! desynchronization on a terminal dispatch arm, exhaustion of the
//! controller or tunnel pool, loss of the tunnel upstream) logs at error
//! level and exits with status 1.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use ofmux::{cli::RunMode, tunnel, Args, Service};

mod logging;
use logging::ConsoleFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Map -v flags to the filter shared by both layers.
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Detailed layer: file (daily rotation) or stderr. The guard must stay
    // alive for the life of the process or file logging silently stops.
    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("ofmux.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "ofmux.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean operator-facing stdout, unless silenced.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ConsoleFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    info!(version = ofmux::VERSION, "starting ofmux");

    let outcome = match &args.mode {
        RunMode::Direct(direct) => {
            let service = Arc::new(Service::new(direct.proxy_config())?);
            service.run().await
        }
        RunMode::Edge(edge) => {
            let service = Arc::new(Service::new(edge.proxy_config())?);
            service.run().await
        }
        RunMode::Tunnel(tunnel_args) => tunnel::run(tunnel_args.tunnel_config()).await,
    };

    if let Err(e) = outcome {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
