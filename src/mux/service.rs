//! # Proxy Service Coordinator
//!
//! A [`Service`] is the concrete coordinator the whole proxy hangs off: it
//! owns the session registries, the dpid index, the correlation table, the
//! role table, the scheduler cursor and the optional capture writer, all
//! behind one mutex. Connection tasks lock it for the duration of a single
//! message dispatch and never across an await point; forwarding a message
//! only enqueues onto the target session's write queue, so holding the lock
//! is always brief.
//!
//! Lifecycle rules enforced here:
//!
//! - A switch session's teardown cascades to its dedicated controller legs
//!   and purges its correlation entries, role row and dpid binding.
//! - Losing a dedicated controller leg shrinks the owning switch's pool;
//!   losing the last one tears the switch down.
//! - Losing the last shared (tunnel) leg is fatal to the whole process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::capture::CaptureWriter;
use crate::framing::{seal_envelope, split_envelope, EnvelopeFramer, OpenFlowFramer};
use crate::mux::correlation::CorrelationTable;
use crate::mux::roles::RoleTable;
use crate::mux::scheduler::{Policy, Scheduler};
use crate::mux::session::{run_writer, spawn_echo_ticker, WriteCmd, WriteHandle};
use crate::mux::{controller, switch, ControllerId, LegFraming, SessionId, SwitchId};
use crate::MuxError;

/// One controller-facing endpoint with its scheduling weight.
///
/// Parsed from `host:port` with an optional `@weight` suffix; the weight
/// only matters under the weighted round-robin policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub addr: String,
    pub weight: u32,
}

impl std::str::FromStr for Upstream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, weight) = match s.rsplit_once('@') {
            Some((addr, raw)) => {
                let weight: u32 = raw
                    .parse()
                    .map_err(|_| format!("invalid weight in endpoint: {raw}"))?;
                if weight == 0 {
                    return Err("endpoint weight must be at least 1".to_string());
                }
                (addr, weight)
            }
            None => (s, 1),
        };
        if !addr.contains(':') {
            return Err(format!("endpoint must be host:port, got: {addr}"));
        }
        Ok(Self {
            addr: addr.to_string(),
            weight,
        })
    }
}

/// Static configuration of one proxy process (direct or edge variant).
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Switch-edge listen address.
    pub listen: String,
    /// Controller endpoints (direct) or tunnel endpoints (edge).
    pub upstreams: Vec<Upstream>,
    /// Framing on the controller-facing legs; this is the only difference
    /// between the two proxy variants.
    pub leg_framing: LegFraming,
    /// PACKET_IN scheduling policy.
    pub policy: Policy,
    /// Keepalive period on dialed OpenFlow legs.
    pub echo_interval: Duration,
    /// Optional PACKET_IN/PACKET_OUT capture file.
    pub capture: Option<PathBuf>,
}

pub(crate) struct SwitchEntry {
    pub(crate) write: WriteHandle,
    pub(crate) dpid: Option<u64>,
    /// Dedicated controller legs in configured order (direct variant only;
    /// edge-variant switches share `State::shared_legs`).
    pub(crate) legs: Vec<ControllerId>,
    pub(crate) hello_seen: bool,
    pub(crate) peer: SocketAddr,
}

pub(crate) struct ControllerEntry {
    pub(crate) write: WriteHandle,
    /// `Some` for a dedicated per-switch leg, `None` for a shared tunnel leg.
    pub(crate) owner: Option<SwitchId>,
    pub(crate) addr: String,
    pub(crate) weight: u32,
}

pub(crate) struct State {
    pub(crate) next_session: SessionId,
    pub(crate) switches: HashMap<SwitchId, SwitchEntry>,
    pub(crate) controllers: HashMap<ControllerId, ControllerEntry>,
    pub(crate) shared_legs: Vec<ControllerId>,
    pub(crate) dpids: HashMap<u64, SwitchId>,
    pub(crate) pending: CorrelationTable,
    pub(crate) roles: RoleTable,
    pub(crate) scheduler: Scheduler,
    pub(crate) capture: Option<CaptureWriter>,
    pub(crate) fatal: Option<mpsc::UnboundedSender<MuxError>>,
}

impl State {
    pub(crate) fn alloc_session(&mut self) -> SessionId {
        let id = self.next_session;
        self.next_session += 1;
        id
    }

    /// Raise a process-fatal condition; `run` observes it and exits.
    pub(crate) fn raise_fatal(&mut self, err: MuxError) {
        if let Some(tx) = &self.fatal {
            let _ = tx.send(err);
        }
    }
}

/// The proxy service. Construct one per process (tests build a fresh one
/// per case) and drive it with [`Service::run`].
pub struct Service {
    pub(crate) config: ProxyConfig,
    pub(crate) inner: Mutex<State>,
}

impl Service {
    pub fn new(config: ProxyConfig) -> Result<Self, MuxError> {
        let capture = match &config.capture {
            Some(path) => {
                info!(path = %path.display(), "capture enabled");
                Some(CaptureWriter::open(path)?)
            }
            None => None,
        };
        let scheduler = Scheduler::new(config.policy);
        Ok(Self {
            config,
            inner: Mutex::new(State {
                next_session: 1,
                switches: HashMap::new(),
                controllers: HashMap::new(),
                shared_legs: Vec::new(),
                dpids: HashMap::new(),
                pending: CorrelationTable::new(),
                roles: RoleTable::new(),
                scheduler,
                capture,
                fatal: None,
            }),
        })
    }

    /// Accept switch connections until a fatal condition surfaces.
    ///
    /// In the edge variant the shared tunnel legs are dialed up front, before
    /// the listener opens, so the first switch already has somewhere to go.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.lock();
            state.fatal = Some(fatal_tx);
            if self.config.leg_framing == LegFraming::Envelope {
                let upstreams = self.config.upstreams.clone();
                for upstream in &upstreams {
                    self.register_leg(&mut state, None, upstream);
                }
            }
        }

        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(listen = %self.config.listen, upstreams = self.config.upstreams.len(),
              "proxy listening for switches");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_switch_session(stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(err) = fatal_rx.recv() => {
                    error!(error = %err, "fatal condition, shutting down");
                    return Err(err.into());
                }
            }
        }
    }

    /// Register an inbound switch connection and start its reader and
    /// writer tasks.
    fn spawn_switch_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let (write, write_rx) = WriteHandle::channel();
        let id = {
            let mut state = self.inner.lock();
            let id = state.alloc_session();
            state.switches.insert(
                id,
                SwitchEntry {
                    write,
                    dpid: None,
                    legs: Vec::new(),
                    hello_seen: false,
                    peer,
                },
            );
            id
        };
        info!(switch = id, %peer, "switch connected");
        tokio::spawn(run_writer(write_half, write_rx));
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.read_switch(id, read_half).await;
            service.close_switch(id);
        });
    }

    async fn read_switch(self: &Arc<Self>, id: SwitchId, mut read_half: OwnedReadHalf) {
        let mut framer = OpenFlowFramer::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    debug!(switch = id, error = %e, "switch read failed");
                    return;
                }
            };
            framer.push(&buf[..n]);
            loop {
                match framer.next() {
                    Ok(Some(frame)) => {
                        let mut state = self.inner.lock();
                        if let Err(e) = switch::handle(self, &mut state, id, frame) {
                            error!(switch = id, error = %e, "switch session fatal");
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(switch = id, error = %e, "switch framing error");
                        return;
                    }
                }
            }
        }
    }

    /// Register a controller-facing leg and start dialing it.
    ///
    /// The leg's write queue exists from this moment, so dispatch can target
    /// it immediately; frames queued while the connect is in flight are
    /// delivered once the writer task starts. This keeps the leg list in
    /// stable configured order regardless of connect latency.
    pub(crate) fn register_leg(
        self: &Arc<Self>,
        state: &mut State,
        owner: Option<SwitchId>,
        upstream: &Upstream,
    ) -> ControllerId {
        let id = state.alloc_session();
        let (write, write_rx) = WriteHandle::channel();
        state.controllers.insert(
            id,
            ControllerEntry {
                write: write.clone(),
                owner,
                addr: upstream.addr.clone(),
                weight: upstream.weight,
            },
        );
        match owner {
            Some(switch) => {
                if let Some(entry) = state.switches.get_mut(&switch) {
                    entry.legs.push(id);
                }
            }
            None => state.shared_legs.push(id),
        }
        let service = Arc::clone(self);
        let addr = upstream.addr.clone();
        tokio::spawn(async move {
            service.dial_leg(id, addr, write, write_rx).await;
            service.close_controller(id);
        });
        id
    }

    async fn dial_leg(
        self: &Arc<Self>,
        id: ControllerId,
        addr: String,
        write: WriteHandle,
        write_rx: mpsc::UnboundedReceiver<WriteCmd>,
    ) {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(leg = id, %addr, error = %e, "upstream dial failed");
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(leg = id, error = %e, "failed to set TCP_NODELAY");
        }
        info!(leg = id, %addr, "upstream connected");
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(run_writer(write_half, write_rx));
        match self.config.leg_framing {
            LegFraming::Plain => {
                spawn_echo_ticker(write, self.config.echo_interval);
                self.read_plain_leg(id, read_half).await;
            }
            LegFraming::Envelope => self.read_envelope_leg(id, read_half).await,
        }
    }

    /// Reader for a dedicated controller leg: plain OpenFlow frames, all
    /// belonging to the one switch that owns the leg.
    async fn read_plain_leg(self: &Arc<Self>, id: ControllerId, mut read_half: OwnedReadHalf) {
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
                    Ok(Some(frame)) => {
                        let mut state = self.inner.lock();
                        let Some(owner) = state.controllers.get(&id).and_then(|c| c.owner) else {
                            return; // leg already unregistered
                        };
                        if let Err(e) = controller::handle(self, &mut state, id, owner, frame) {
                            error!(leg = id, error = %e, "controller session fatal");
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(leg = id, error = %e, "controller framing error");
                        return;
                    }
                }
            }
        }
    }

    /// Reader for a shared tunnel leg: every frame carries a `(dpid, len)`
    /// envelope naming the switch it belongs to.
    async fn read_envelope_leg(self: &Arc<Self>, id: ControllerId, mut read_half: OwnedReadHalf) {
        let mut framer = EnvelopeFramer::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    debug!(leg = id, error = %e, "tunnel read failed");
                    return;
                }
            };
            framer.push(&buf[..n]);
            loop {
                match framer.next() {
                    Ok(Some(frame)) => {
                        let mut state = self.inner.lock();
                        let result = match split_envelope(&frame) {
                            Ok((dpid, msg)) => match state.dpids.get(&dpid).copied() {
                                Some(switch) => {
                                    controller::handle(self, &mut state, id, switch, msg)
                                }
                                None => Err(MuxError::UnknownDpid(dpid)),
                            },
                            Err(e) => Err(e),
                        };
                        if let Err(e) = result {
                            error!(leg = id, error = %e, "tunnel session fatal");
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(leg = id, error = %e, "tunnel framing error");
                        return;
                    }
                }
            }
        }
    }

    /// Tear down a switch session and everything derived from it.
    pub fn close_switch(&self, id: SwitchId) {
        let mut state = self.inner.lock();
        close_switch_locked(&mut state, id);
    }

    /// Tear down a controller-facing leg, shrinking (or cascading into) the
    /// scope that owned it.
    pub fn close_controller(&self, id: ControllerId) {
        let mut state = self.inner.lock();
        close_controller_locked(&mut state, id);
    }
}

pub(crate) fn close_switch_locked(state: &mut State, id: SwitchId) {
    let Some(entry) = state.switches.remove(&id) else {
        return;
    };
    entry.write.shutdown();
    if let Some(dpid) = entry.dpid {
        state.dpids.remove(&dpid);
    }
    for leg in entry.legs {
        if let Some(controller) = state.controllers.remove(&leg) {
            controller.write.shutdown();
        }
    }
    state.pending.purge_switch(id);
    state.roles.purge_switch(id);
    info!(switch = id, peer = %entry.peer, "switch session closed");
}

pub(crate) fn close_controller_locked(state: &mut State, id: ControllerId) {
    let Some(entry) = state.controllers.remove(&id) else {
        return;
    };
    entry.write.shutdown();
    match entry.owner {
        Some(switch) => {
            state.roles.remove_controller(switch, id);
            let exhausted = match state.switches.get_mut(&switch) {
                Some(owner) => {
                    owner.legs.retain(|leg| *leg != id);
                    owner.legs.is_empty()
                }
                None => false,
            };
            info!(leg = id, switch, addr = %entry.addr, "controller session closed");
            if exhausted {
                warn!(switch, "all controllers lost, terminating switch session");
                close_switch_locked(state, switch);
            }
        }
        None => {
            state.shared_legs.retain(|leg| *leg != id);
            info!(leg = id, addr = %entry.addr, "tunnel leg closed");
            if state.shared_legs.is_empty() {
                state.raise_fatal(MuxError::ControllersExhausted);
            }
        }
    }
}

/// Enqueue a frame toward a switch. A missing or closed session means the
/// switch is going away; the frame is discarded per the no-retry policy.
pub(crate) fn write_switch(state: &mut State, switch: SwitchId, frame: Bytes) {
    if let Some(entry) = state.switches.get(&switch) {
        entry.write.send(frame);
    }
}

/// Enqueue a message toward a controller-facing leg, sealing the envelope
/// when the leg is a shared tunnel pipe. Needs the switch's dpid in that
/// case; traffic cannot reach a tunnel before FEATURES_REPLY bound one.
pub(crate) fn forward_to_leg(
    state: &mut State,
    framing: LegFraming,
    switch: SwitchId,
    leg: ControllerId,
    msg: Bytes,
) -> Result<(), MuxError> {
    let frame = match framing {
        LegFraming::Plain => msg,
        LegFraming::Envelope => {
            let dpid = state
                .switches
                .get(&switch)
                .and_then(|s| s.dpid)
                .ok_or(MuxError::DpidPending)?;
            seal_envelope(dpid, &msg)
        }
    };
    if let Some(entry) = state.controllers.get(&leg) {
        entry.write.send(frame);
    }
    Ok(())
}

/// The controller legs associated with `switch`, in stable insertion order.
pub(crate) fn associated_legs(
    state: &State,
    framing: LegFraming,
    switch: SwitchId,
) -> Vec<ControllerId> {
    match framing {
        LegFraming::Plain => state
            .switches
            .get(&switch)
            .map(|entry| entry.legs.clone())
            .unwrap_or_default(),
        LegFraming::Envelope => state.shared_legs.clone(),
    }
}

/// Append a data-plane message to the capture stream, if one is open.
pub(crate) fn capture_record(state: &mut State, msg: &[u8]) {
    if let Some(writer) = &mut state.capture {
        if let Err(e) = writer.record(msg) {
            warn!(error = %e, "capture write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_parsing() {
        let plain: Upstream = "10.0.3.7:6633".parse().unwrap();
        assert_eq!(plain.addr, "10.0.3.7:6633");
        assert_eq!(plain.weight, 1);

        let weighted: Upstream = "ctl.example:6633@4".parse().unwrap();
        assert_eq!(weighted.addr, "ctl.example:6633");
        assert_eq!(weighted.weight, 4);

        assert!("no-port".parse::<Upstream>().is_err());
        assert!("host:6633@0".parse::<Upstream>().is_err());
        assert!("host:6633@x".parse::<Upstream>().is_err());
    }
}
