//! # OFMux
//!
//! An OpenFlow 1.3 multiplexing proxy. Switches dial a single well-known
//! endpoint; for each switch the proxy maintains independent sessions to a
//! pool of SDN controllers, making the switch appear directly connected to
//! every controller and each controller believe it owns the switch.
//!
//! The crate ships one binary with three run modes sharing a single core
//! engine (framing, request/reply correlation, role tracking, PACKET_IN
//! scheduling):
//!
//! - `direct`: per switch, one dedicated session to every configured
//!   controller.
//! - `edge`: a shared set of envelope-framed tunnel connections carries
//!   traffic for all switches, each message prefixed with
//!   `(datapath id, length)`.
//! - `tunnel`: the far end of the envelope pipe, holding one controller
//!   session per datapath id.

pub mod capture;
pub mod cli;
pub mod framing;
pub mod mux;
pub mod tunnel;
pub mod wire;

pub use cli::{Args, RunMode};
pub use mux::service::Service;

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    /// Default listen port on the switch edge (the OpenFlow well-known port).
    pub const SWITCH_PORT: u16 = 6633;

    /// Default controller port dialed on the controller edge.
    pub const CONTROLLER_PORT: u16 = 6633;

    /// Default listen port of the tunnel process.
    pub const TUNNEL_PORT: u16 = 9999;
}

/// Error taxonomy of the proxy core.
///
/// Every variant except `Io` marks a protocol-level condition that is fatal
/// to the smallest scope unable to maintain its invariants: the session for
/// framing errors, the switch context for correlation and role failures, the
/// process for exhaustion. I/O errors are treated as a graceful close of the
/// session they occurred on.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The byte stream cannot be a valid sequence of messages.
    #[error("framing error: {0}")]
    Framing(String),

    /// A reply arrived for which no requester is waiting.
    #[error("no session awaiting reply for request type {request_type} xid {xid}")]
    CorrelationMiss { request_type: u8, xid: u32 },

    /// A message had to be routed to the master controller but none is known.
    #[error("no master controller recorded for switch")]
    NoMaster,

    /// An envelope frame referenced a datapath id with no bound session.
    #[error("unknown datapath id {0:#018x}")]
    UnknownDpid(u64),

    /// A message required the switch's datapath id before it was learned.
    #[error("switch has not reported a datapath id yet")]
    DpidPending,

    /// Every controller-facing leg of the relevant scope is gone.
    #[error("all controller sessions lost")]
    ControllersExhausted,

    /// The tunnel's single upstream connection ended.
    #[error("tunnel connection lost")]
    TunnelLost,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
