//! # Core Multiplexer Engine
//!
//! Everything both proxy variants share: the session plumbing (one reader
//! task and one serialized writer task per TCP connection), the correlation
//! table pairing controller requests with switch replies, the role tracker,
//! the PACKET_IN scheduler and the coordinating [`service::Service`] that
//! owns all mutable state behind a single lock.
//!
//! The direct and edge variants differ only in how the controller-facing leg
//! frames bytes: plain OpenFlow toward real controllers, or the 10-byte
//! `(dpid, length)` envelope toward a tunnel that carries many switches over
//! one pipe.

pub mod controller;
pub mod correlation;
pub mod roles;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod switch;

/// Process-unique identifier assigned to every TCP session.
pub type SessionId = u64;

/// Identifier of a switch-side session.
pub type SwitchId = SessionId;

/// Identifier of a controller-facing session (a controller or a tunnel leg).
pub type ControllerId = SessionId;

/// Framing applied on the controller-facing legs of a proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LegFraming {
    /// Plain OpenFlow toward dedicated per-switch controller sessions.
    Plain,
    /// Envelope-prefixed OpenFlow toward shared tunnel sessions.
    Envelope,
}
