//! # Controller-Side Dispatch
//!
//! Messages arriving from a controller (or, in the edge variant, from a
//! tunnel after its envelope is stripped) are mostly passed straight to the
//! owning switch. The exceptions: session chatter (HELLO, echo) is handled
//! locally so the proxy looks like a live switch to every controller, and
//! request types that demand a switch reply are recorded in the correlation
//! table first so the eventual reply finds its way back.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::mux::service::{capture_record, forward_to_leg, write_switch, Service, State};
use crate::mux::{ControllerId, SwitchId};
use crate::wire::{
    control_message, types, Header, CONTROLLER_REQUEST_TYPES, HEADER_LEN,
};
use crate::MuxError;

/// Dispatch one message from a controller-facing leg toward `switch`.
pub(crate) fn handle(
    service: &Service,
    state: &mut State,
    leg: ControllerId,
    switch: SwitchId,
    msg: Bytes,
) -> Result<(), MuxError> {
    let header = Header::parse(&msg)?;
    trace!(leg, switch, msg_type = header.msg_type, xid = header.xid, "controller message");

    match header.msg_type {
        types::HELLO => {
            debug!(leg, "hello from upstream absorbed");
            Ok(())
        }
        types::ECHO_REPLY => {
            trace!(leg, "echo reply absorbed");
            Ok(())
        }
        types::ECHO_REQUEST => {
            // Keepalive; answered here, the switch never sees it.
            let reply = control_message(types::ECHO_REPLY, header.xid, &msg[HEADER_LEN..]);
            forward_to_leg(state, service.config.leg_framing, switch, leg, reply)
        }
        types::PACKET_OUT => {
            capture_record(state, &msg);
            write_switch(state, switch, msg);
            Ok(())
        }
        request if CONTROLLER_REQUEST_TYPES.contains(&request) => {
            state.pending.record(switch, request, header.xid, leg);
            write_switch(state, switch, msg);
            Ok(())
        }
        _ => {
            write_switch(state, switch, msg);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::scheduler::Policy;
    use crate::mux::service::{ControllerEntry, ProxyConfig, SwitchEntry, Upstream};
    use crate::mux::session::{WriteCmd, WriteHandle};
    use crate::mux::LegFraming;
    use crate::wire::fresh_xid;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_service() -> Arc<Service> {
        Arc::new(
            Service::new(ProxyConfig {
                listen: "127.0.0.1:0".to_string(),
                upstreams: vec![Upstream {
                    addr: "127.0.0.1:1".to_string(),
                    weight: 1,
                }],
                leg_framing: LegFraming::Plain,
                policy: Policy::RoundRobin,
                echo_interval: std::time::Duration::from_secs(5),
                capture: None,
            })
            .unwrap(),
        )
    }

    fn setup(
        service: &Service,
    ) -> (
        SwitchId,
        UnboundedReceiver<WriteCmd>,
        ControllerId,
        UnboundedReceiver<WriteCmd>,
    ) {
        let mut state = service.inner.lock();
        let switch = state.alloc_session();
        let (switch_write, switch_rx) = WriteHandle::channel();
        state.switches.insert(
            switch,
            SwitchEntry {
                write: switch_write,
                dpid: Some(1),
                legs: Vec::new(),
                hello_seen: true,
                peer: "127.0.0.1:40000".parse().unwrap(),
            },
        );
        let leg = state.alloc_session();
        let (leg_write, leg_rx) = WriteHandle::channel();
        state.controllers.insert(
            leg,
            ControllerEntry {
                write: leg_write,
                owner: Some(switch),
                addr: "127.0.0.1:6633".to_string(),
                weight: 1,
            },
        );
        state.switches.get_mut(&switch).unwrap().legs.push(leg);
        (switch, switch_rx, leg, leg_rx)
    }

    fn frames(rx: &mut UnboundedReceiver<WriteCmd>) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(WriteCmd::Frame(frame)) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    fn dispatch(service: &Arc<Service>, leg: ControllerId, switch: SwitchId, msg: Bytes) {
        let mut state = service.inner.lock();
        handle(service, &mut state, leg, switch, msg).unwrap();
    }

    #[test]
    fn hello_and_echo_reply_are_absorbed() {
        let service = test_service();
        let (switch, mut switch_rx, leg, mut leg_rx) = setup(&service);

        dispatch(&service, leg, switch, control_message(types::HELLO, fresh_xid(), &[]));
        dispatch(&service, leg, switch, control_message(types::ECHO_REPLY, 3, &[]));
        assert!(frames(&mut switch_rx).is_empty());
        assert!(frames(&mut leg_rx).is_empty());
    }

    #[test]
    fn echo_request_is_answered_on_the_same_leg() {
        let service = test_service();
        let (switch, mut switch_rx, leg, mut leg_rx) = setup(&service);

        dispatch(
            &service,
            leg,
            switch,
            control_message(types::ECHO_REQUEST, 88, b"ka"),
        );
        assert!(frames(&mut switch_rx).is_empty());
        let written = frames(&mut leg_rx);
        assert_eq!(written.len(), 1);
        assert_eq!(written[0][1], types::ECHO_REPLY);
        assert_eq!(u32::from_be_bytes(written[0][4..8].try_into().unwrap()), 88);
        assert_eq!(&written[0][8..], b"ka");
    }

    #[test]
    fn requests_are_recorded_before_forwarding() {
        let service = test_service();
        let (switch, mut switch_rx, leg, _leg_rx) = setup(&service);

        for request in CONTROLLER_REQUEST_TYPES {
            dispatch(
                &service,
                leg,
                switch,
                control_message(request, u32::from(request), &[]),
            );
        }
        assert_eq!(frames(&mut switch_rx).len(), CONTROLLER_REQUEST_TYPES.len());

        let mut state = service.inner.lock();
        for request in CONTROLLER_REQUEST_TYPES {
            assert_eq!(
                state.pending.resolve(switch, request, u32::from(request), false),
                Some(leg)
            );
        }
    }

    #[test]
    fn other_types_pass_through_unrecorded() {
        let service = test_service();
        let (switch, mut switch_rx, leg, _leg_rx) = setup(&service);

        // FLOW_MOD (14) solicits no reply.
        let flow_mod = control_message(14, 9, &[0u8; 40]);
        dispatch(&service, leg, switch, flow_mod.clone());
        assert_eq!(frames(&mut switch_rx), vec![flow_mod]);

        let state = service.inner.lock();
        assert_eq!(state.pending.len(), 0);
    }

    #[test]
    fn packet_out_reaches_the_switch() {
        let service = test_service();
        let (switch, mut switch_rx, leg, _leg_rx) = setup(&service);

        let packet_out = control_message(types::PACKET_OUT, 5, &[0u8; 16]);
        dispatch(&service, leg, switch, packet_out.clone());
        assert_eq!(frames(&mut switch_rx), vec![packet_out]);
    }
}
