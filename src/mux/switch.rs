//! # Switch-Side Dispatch
//!
//! Every framed message read from a switch lands here. The handler owns the
//! handshake synthesis (the proxy, not a controller, answers HELLO and
//! solicits the datapath id), resolves replies back to the controller that
//! asked via the correlation table, schedules PACKET_IN events across the
//! pool and routes everything else to the current master.
//!
//! Dispatch runs under the service lock and never awaits; forwarding only
//! enqueues on write queues.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::mux::roles::Role;
use crate::mux::service::{
    associated_legs, capture_record, forward_to_leg, write_switch, Service, State,
};
use crate::mux::{ControllerId, LegFraming, SwitchId};
use crate::wire::{
    control_message, features_reply_dpid, fresh_xid, is_topology_packet, multipart_has_more,
    role_reply_role, types, Header, HEADER_LEN, SWITCH_REPLY_TYPES,
};
use crate::MuxError;

/// Dispatch one framed switch message.
///
/// An `Err` is fatal to the switch session; the caller tears it down along
/// with everything derived from it.
pub(crate) fn handle(
    service: &Arc<Service>,
    state: &mut State,
    switch: SwitchId,
    msg: Bytes,
) -> Result<(), MuxError> {
    let header = Header::parse(&msg)?;
    trace!(switch, msg_type = header.msg_type, xid = header.xid, len = header.length,
           "switch message");

    match header.msg_type {
        types::HELLO => on_hello(service, state, switch),
        types::ECHO_REQUEST => {
            let reply = control_message(types::ECHO_REPLY, header.xid, &msg[HEADER_LEN..]);
            write_switch(state, switch, reply);
            Ok(())
        }
        types::FEATURES_REPLY => on_features_reply(service, state, switch, &header, msg),
        types::PACKET_IN => on_packet_in(service, state, switch, msg),
        types::MULTIPART_REPLY => {
            // While MORE is set the entry stays queued so every fragment of
            // the exchange reaches the same controller.
            let peek = multipart_has_more(&msg);
            let leg = state
                .pending
                .resolve(switch, types::MULTIPART_REQUEST, header.xid, peek)
                .ok_or(MuxError::CorrelationMiss {
                    request_type: types::MULTIPART_REQUEST,
                    xid: header.xid,
                })?;
            forward_to_leg(state, service.config.leg_framing, switch, leg, msg)
        }
        types::ROLE_REPLY => on_role_reply(service, state, switch, &header, msg),
        reply if SWITCH_REPLY_TYPES.contains(&reply) => {
            // Remaining reply types pair with the request numerically one
            // below them.
            let request_type = reply - 1;
            let leg = state
                .pending
                .resolve(switch, request_type, header.xid, false)
                .ok_or(MuxError::CorrelationMiss {
                    request_type,
                    xid: header.xid,
                })?;
            forward_to_leg(state, service.config.leg_framing, switch, leg, msg)
        }
        other => {
            // Switch-initiated asynchronous messages belong to whoever holds
            // the master role; without one the session cannot stay coherent.
            let master = state.roles.master(switch).ok_or(MuxError::NoMaster)?;
            debug!(switch, msg_type = other, master, "routing switch message to master");
            forward_to_leg(state, service.config.leg_framing, switch, master, msg)
        }
    }
}

/// First HELLO: open the controller legs and run the proxy's half of the
/// handshake. Later HELLOs are idempotent.
fn on_hello(service: &Arc<Service>, state: &mut State, switch: SwitchId) -> Result<(), MuxError> {
    {
        let Some(entry) = state.switches.get_mut(&switch) else {
            return Ok(());
        };
        if entry.hello_seen {
            debug!(switch, "duplicate hello ignored");
            return Ok(());
        }
        entry.hello_seen = true;
    }

    if service.config.leg_framing == LegFraming::Plain {
        let upstreams = service.config.upstreams.clone();
        for upstream in &upstreams {
            service.register_leg(state, Some(switch), upstream);
        }
    }

    // Answer on the controllers' behalf, then solicit the datapath id.
    write_switch(state, switch, control_message(types::HELLO, fresh_xid(), &[]));
    write_switch(
        state,
        switch,
        control_message(types::FEATURES_REQUEST, fresh_xid(), &[]),
    );
    info!(switch, "handshake started");
    Ok(())
}

/// The first FEATURES_REPLY answers the proxy's own request and binds the
/// datapath id; any later one was controller-initiated and is forwarded.
fn on_features_reply(
    service: &Arc<Service>,
    state: &mut State,
    switch: SwitchId,
    header: &Header,
    msg: Bytes,
) -> Result<(), MuxError> {
    let known = state.switches.get(&switch).and_then(|entry| entry.dpid);
    if known.is_some() {
        let leg = state
            .pending
            .resolve(switch, types::FEATURES_REQUEST, header.xid, false)
            .ok_or(MuxError::CorrelationMiss {
                request_type: types::FEATURES_REQUEST,
                xid: header.xid,
            })?;
        return forward_to_leg(state, service.config.leg_framing, switch, leg, msg);
    }

    let dpid = features_reply_dpid(&msg)
        .ok_or_else(|| MuxError::Framing("truncated FEATURES_REPLY".to_string()))?;
    if let Some(entry) = state.switches.get_mut(&switch) {
        entry.dpid = Some(dpid);
    }
    state.dpids.insert(dpid, switch);
    info!(switch, dpid, "datapath id learned");

    // Announce the switch on every associated leg. The reply itself is
    // consumed here, never forwarded.
    let framing = service.config.leg_framing;
    let hello = control_message(types::HELLO, fresh_xid(), &[]);
    for leg in associated_legs(state, framing, switch) {
        forward_to_leg(state, framing, switch, leg, hello.clone())?;
    }
    Ok(())
}

/// Topology traffic goes to the master; everything else is scheduled.
fn on_packet_in(
    service: &Arc<Service>,
    state: &mut State,
    switch: SwitchId,
    msg: Bytes,
) -> Result<(), MuxError> {
    let framing = service.config.leg_framing;
    let legs = associated_legs(state, framing, switch);
    if legs.is_empty() {
        return Err(MuxError::ControllersExhausted);
    }
    let master = state.roles.master(switch);

    let target = if is_topology_packet(&msg) {
        master.unwrap_or(legs[0])
    } else {
        let pool: Vec<(ControllerId, u32)> = legs
            .iter()
            .map(|leg| {
                let weight = state
                    .controllers
                    .get(leg)
                    .map(|entry| entry.weight)
                    .unwrap_or(1);
                (*leg, weight)
            })
            .collect();
        state
            .scheduler
            .pick(&pool, master)
            .ok_or(MuxError::ControllersExhausted)?
    };

    forward_to_leg(state, framing, switch, target, msg.clone())?;
    capture_record(state, &msg);
    Ok(())
}

/// ROLE_REPLY resolves the requesting controller, updates the role table
/// (demoting a displaced master) and forwards the acceptance.
fn on_role_reply(
    service: &Arc<Service>,
    state: &mut State,
    switch: SwitchId,
    header: &Header,
    msg: Bytes,
) -> Result<(), MuxError> {
    let leg = state
        .pending
        .resolve(switch, types::ROLE_REQUEST, header.xid, false)
        .ok_or(MuxError::CorrelationMiss {
            request_type: types::ROLE_REQUEST,
            xid: header.xid,
        })?;

    if let Some(role) = role_reply_role(&msg).and_then(Role::from_wire) {
        match state.roles.accept(switch, leg, role) {
            Some(demoted) => info!(switch, master = leg, demoted,
                                   "master takeover, previous master demoted to slave"),
            None if role == Role::Master => info!(switch, master = leg, "master recorded"),
            None => debug!(switch, leg, ?role, "role recorded"),
        }
    }
    forward_to_leg(state, service.config.leg_framing, switch, leg, msg)
}
