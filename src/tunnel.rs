//! # Tunnel Process
//!
//! The far end of the envelope pipe. A single upstream connection (from an
//! edge-variant proxy) carries traffic for many switches, each frame wrapped
//! in a `(dpid, length)` envelope. The tunnel terminates the envelope: it
//! keeps one controller session per datapath id, dialing a new one when the
//! first enveloped HELLO for an unknown dpid arrives, and wraps everything a
//! controller sends back with the dpid that owns the session.
//!
//! The upstream connection is the tunnel's reason to exist; losing it shuts
//! the process down. Losing a controller session only unbinds its dpid.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::framing::{seal_envelope, split_envelope, EnvelopeFramer, OpenFlowFramer};
use crate::mux::session::{run_writer, spawn_echo_ticker, WriteCmd, WriteHandle};
use crate::mux::{ControllerId, SessionId};
use crate::wire::{control_message, fresh_xid, types, Header, HEADER_LEN};
use crate::MuxError;

/// Static configuration of one tunnel process.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// Listen address for the envelope-framed upstream pipe.
    pub listen: String,
    /// Controller endpoint dialed once per datapath id.
    pub controller: String,
    /// Keepalive period on the controller sessions.
    pub echo_interval: Duration,
}

struct Leg {
    dpid: u64,
    write: WriteHandle,
}

struct TunnelState {
    next_session: SessionId,
    upstream: Option<WriteHandle>,
    legs: HashMap<ControllerId, Leg>,
    dpids: HashMap<u64, ControllerId>,
    fatal: Option<mpsc::UnboundedSender<MuxError>>,
}

impl TunnelState {
    fn raise_fatal(&mut self, err: MuxError) {
        if let Some(tx) = &self.fatal {
            let _ = tx.send(err);
        }
    }
}

/// The tunnel coordinator; mirrors [`crate::Service`] with a dpid-keyed
/// session map instead of the full registry set.
pub struct Tunnel {
    config: TunnelConfig,
    inner: Mutex<TunnelState>,
}

/// Run a tunnel process until its upstream connection is lost.
pub async fn run(config: TunnelConfig) -> anyhow::Result<()> {
    Arc::new(Tunnel::new(config)).run().await
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(TunnelState {
                next_session: 1,
                upstream: None,
                legs: HashMap::new(),
                dpids: HashMap::new(),
                fatal: None,
            }),
        }
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        self.inner.lock().fatal = Some(fatal_tx);

        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(listen = %self.config.listen, controller = %self.config.controller,
              "tunnel listening for upstream");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept_upstream(stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(err) = fatal_rx.recv() => {
                    error!(error = %err, "fatal condition, shutting tunnel down");
                    return Err(err.into());
                }
            }
        }
    }

    /// Bind the single upstream pipe; extra connection attempts are refused.
    fn accept_upstream(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut state = self.inner.lock();
        if state.upstream.is_some() {
            warn!(%peer, "second upstream connection refused");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (write, write_rx) = WriteHandle::channel();
        state.upstream = Some(write);
        drop(state);
        info!(%peer, "upstream connected");

        tokio::spawn(run_writer(write_half, write_rx));
        let tunnel = Arc::clone(self);
        tokio::spawn(async move {
            tunnel.read_upstream(read_half).await;
            // Whatever ended the upstream pipe ends the tunnel.
            let mut state = tunnel.inner.lock();
            if let Some(write) = state.upstream.take() {
                write.shutdown();
            }
            state.raise_fatal(MuxError::TunnelLost);
        });
    }

    async fn read_upstream(self: &Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut framer = EnvelopeFramer::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "upstream read failed");
                    return;
                }
            };
            framer.push(&buf[..n]);
            loop {
                match framer.next() {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.on_upstream_frame(frame) {
                            error!(error = %e, "upstream protocol error");
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "upstream framing error");
                        return;
                    }
                }
            }
        }
    }

    /// Route one enveloped frame to the controller session bound to its
    /// dpid, dialing a fresh session when a new dpid introduces itself with
    /// HELLO. A non-HELLO for an unknown dpid means the two ends have
    /// diverged, which is fatal.
    fn on_upstream_frame(self: &Arc<Self>, frame: Bytes) -> Result<(), MuxError> {
        let (dpid, msg) = split_envelope(&frame)?;
        let header = Header::parse(&msg)?;
        trace!(dpid, msg_type = header.msg_type, "upstream frame");

        let mut state = self.inner.lock();
        if let Some(leg) = state.dpids.get(&dpid).copied() {
            if let Some(entry) = state.legs.get(&leg) {
                entry.write.send(msg);
            }
            return Ok(());
        }
        if header.msg_type != types::HELLO {
            return Err(MuxError::UnknownDpid(dpid));
        }
        self.open_leg(&mut state, dpid);
        Ok(())
    }

    /// Register a controller session for a new dpid and start dialing it.
    /// The proxy's HELLO is not forwarded; the new session greets the
    /// controller itself once registered.
    fn open_leg(self: &Arc<Self>, state: &mut TunnelState, dpid: u64) {
        let id = state.next_session;
        state.next_session += 1;
        let (write, write_rx) = WriteHandle::channel();
        write.send(control_message(types::HELLO, fresh_xid(), &[]));
        state.legs.insert(
            id,
            Leg {
                dpid,
                write: write.clone(),
            },
        );
        state.dpids.insert(dpid, id);
        info!(leg = id, dpid, "controller session opening");

        let tunnel = Arc::clone(self);
        tokio::spawn(async move {
            tunnel.dial_leg(id, write, write_rx).await;
            tunnel.close_leg(id);
        });
    }

    async fn dial_leg(
        self: &Arc<Self>,
        id: ControllerId,
        write: WriteHandle,
        write_rx: mpsc::UnboundedReceiver<WriteCmd>,
    ) {
        let stream = match TcpStream::connect(&self.config.controller).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(leg = id, controller = %self.config.controller, error = %e,
                      "controller dial failed");
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(leg = id, error = %e, "failed to set TCP_NODELAY");
        }
        info!(leg = id, controller = %self.config.controller, "controller connected");
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(run_writer(write_half, write_rx));
        spawn_echo_ticker(write, self.config.echo_interval);
        self.read_leg(id, read_half).await;
    }

    async fn read_leg(self: &Arc<Self>, id: ControllerId, mut read_half: OwnedReadHalf) {
        let mut framer = OpenFlowFramer::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    debug!(leg = id, error = %e, "controller read failed");
                    return;
                }
            };
            framer.push(&buf[..n]);
            loop {
                match framer.next() {
                    Ok(Some(frame)) => self.on_leg_frame(id, frame),
                    Ok(None) => break,
                    Err(e) => {
                        error!(leg = id, error = %e, "controller framing error");
                        return;
                    }
                }
            }
        }
    }

    /// Messages from a controller: session chatter stays local, everything
    /// else is wrapped with the owning dpid and written upstream.
    fn on_leg_frame(&self, id: ControllerId, msg: Bytes) {
        let header = match Header::parse(&msg) {
            Ok(header) => header,
            Err(e) => {
                debug!(leg = id, error = %e, "unparseable controller message dropped");
                return;
            }
        };
        let state = self.inner.lock();
        let Some(leg) = state.legs.get(&id) else {
            return;
        };
        match header.msg_type {
            types::HELLO => debug!(leg = id, "hello from controller absorbed"),
            types::ECHO_REPLY => trace!(leg = id, "echo reply absorbed"),
            types::ECHO_REQUEST => {
                let reply = control_message(types::ECHO_REPLY, header.xid, &msg[HEADER_LEN..]);
                leg.write.send(reply);
            }
            _ => {
                if let Some(upstream) = &state.upstream {
                    upstream.send(seal_envelope(leg.dpid, &msg));
                } else {
                    debug!(leg = id, "upstream gone, controller message dropped");
                }
            }
        }
    }

    fn close_leg(&self, id: ControllerId) {
        let mut state = self.inner.lock();
        if let Some(leg) = state.legs.remove(&id) {
            leg.write.shutdown();
            state.dpids.remove(&leg.dpid);
            info!(leg = id, dpid = leg.dpid, "controller session closed");
        }
    }
}
