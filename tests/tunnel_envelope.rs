//! Tunnel variant scenarios: envelope sealing on the wire, dial-per-dpid in
//! the tunnel process, the full switch - edge proxy - tunnel - controller
//! chain, and upstream-loss fatality.

use std::sync::Arc;
use std::time::Duration;

use ofmux::mux::scheduler::Policy;
use ofmux::mux::service::{ProxyConfig, Upstream};
use ofmux::mux::LegFraming;
use ofmux::tunnel::{self, TunnelConfig};
use ofmux::wire::{control_message, types};
use ofmux::Service;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

async fn read_msg(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 8];
    timeout(WAIT, stream.read_exact(&mut header))
        .await
        .expect("timed out waiting for message")
        .unwrap();
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut msg = header.to_vec();
    msg.resize(len, 0);
    if len > 8 {
        timeout(WAIT, stream.read_exact(&mut msg[8..]))
            .await
            .expect("timed out waiting for body")
            .unwrap();
    }
    msg
}

/// Read one envelope-framed message, returning the dpid and the enclosed
/// OpenFlow bytes.
async fn read_envelope(stream: &mut TcpStream) -> (u64, Vec<u8>) {
    let mut header = [0u8; 10];
    timeout(WAIT, stream.read_exact(&mut header))
        .await
        .expect("timed out waiting for envelope")
        .unwrap();
    let dpid = u64::from_be_bytes(header[..8].try_into().unwrap());
    let len = u16::from_be_bytes([header[8], header[9]]) as usize;
    let mut msg = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut msg))
        .await
        .expect("timed out waiting for envelope payload")
        .unwrap();
    (dpid, msg)
}

fn xid_of(msg: &[u8]) -> u32 {
    u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]])
}

fn features_reply(xid: u32, dpid: u64) -> Vec<u8> {
    let mut body = dpid.to_be_bytes().to_vec();
    body.extend_from_slice(&[0u8; 24]);
    control_message(types::FEATURES_REPLY, xid, &body).to_vec()
}

#[tokio::test]
async fn tunnel_dials_per_dpid_and_strips_the_envelope() {
    let controller = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = TunnelConfig {
        listen: "127.0.0.1:19711".to_string(),
        controller: controller.local_addr().unwrap().to_string(),
        echo_interval: Duration::from_secs(60),
    };
    tokio::spawn(tunnel::run(config));
    sleep(Duration::from_millis(100)).await;

    let mut upstream = TcpStream::connect("127.0.0.1:19711").await.unwrap();

    // A hello for dpid 5 behind the 10-byte envelope.
    upstream
        .write_all(&[
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x00, 0x08, 0x04, 0x00, 0x00, 0x08,
            0x00, 0x00, 0x00, 0x01,
        ])
        .await
        .unwrap();

    // The tunnel dials the controller for the new dpid and greets it with
    // its own hello; the enveloped one is consumed.
    let (mut ctl, _) = timeout(WAIT, controller.accept())
        .await
        .expect("controller was not dialed")
        .unwrap();
    let hello = read_msg(&mut ctl).await;
    assert_eq!(hello[1], types::HELLO);

    // Controller-bound traffic for the dpid is stripped of the envelope.
    let flow_mod = control_message(14, 33, &[0u8; 24]);
    let mut framed = 5u64.to_be_bytes().to_vec();
    framed.extend_from_slice(&(flow_mod.len() as u16).to_be_bytes());
    framed.extend_from_slice(&flow_mod);
    upstream.write_all(&framed).await.unwrap();
    let received = read_msg(&mut ctl).await;
    assert_eq!(received, flow_mod.to_vec());

    // And controller responses come back wrapped with the owning dpid.
    let packet_out = control_message(types::PACKET_OUT, 44, &[0u8; 16]);
    ctl.write_all(&packet_out).await.unwrap();
    let (dpid, msg) = read_envelope(&mut upstream).await;
    assert_eq!(dpid, 5);
    assert_eq!(msg, packet_out.to_vec());
}

#[tokio::test]
async fn switch_to_controller_through_edge_and_tunnel() {
    // Chain: switch -> edge proxy -> tunnel -> controller.
    let controller = TcpListener::bind("127.0.0.1:0").await.unwrap();
    tokio::spawn(tunnel::run(TunnelConfig {
        listen: "127.0.0.1:19712".to_string(),
        controller: controller.local_addr().unwrap().to_string(),
        echo_interval: Duration::from_secs(60),
    }));
    sleep(Duration::from_millis(100)).await;

    let service = Arc::new(
        Service::new(ProxyConfig {
            listen: "127.0.0.1:19713".to_string(),
            upstreams: vec![Upstream {
                addr: "127.0.0.1:19712".to_string(),
                weight: 1,
            }],
            leg_framing: LegFraming::Envelope,
            policy: Policy::RoundRobin,
            echo_interval: Duration::from_secs(60),
            capture: None,
        })
        .unwrap(),
    );
    tokio::spawn(service.run());
    sleep(Duration::from_millis(100)).await;

    // Switch handshake against the edge proxy.
    let mut switch = TcpStream::connect("127.0.0.1:19713").await.unwrap();
    switch
        .write_all(&[0x04, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x07])
        .await
        .unwrap();
    let hello = read_msg(&mut switch).await;
    assert_eq!(hello[1], types::HELLO);
    let features_request = read_msg(&mut switch).await;
    assert_eq!(features_request[1], types::FEATURES_REQUEST);
    switch
        .write_all(&features_reply(xid_of(&features_request), 5))
        .await
        .unwrap();

    // The dpid announcement rides the envelope pipe and makes the tunnel
    // open a controller session, which greets with hello.
    let (mut ctl, _) = timeout(WAIT, controller.accept())
        .await
        .expect("controller was not dialed through the chain")
        .unwrap();
    assert_eq!(read_msg(&mut ctl).await[1], types::HELLO);

    // Data plane down: PACKET_IN crosses both hops stripped back to plain
    // OpenFlow at the controller.
    let mut body = vec![0u8; 52];
    body[46..48].copy_from_slice(&0x0800u16.to_be_bytes());
    let pkt_in = control_message(types::PACKET_IN, 77, &body);
    switch.write_all(&pkt_in).await.unwrap();
    assert_eq!(read_msg(&mut ctl).await, pkt_in.to_vec());

    // Data plane up: PACKET_OUT comes back to the switch unwrapped.
    let pkt_out = control_message(types::PACKET_OUT, 88, &[0u8; 16]);
    ctl.write_all(&pkt_out).await.unwrap();
    assert_eq!(read_msg(&mut switch).await, pkt_out.to_vec());
}

#[tokio::test]
async fn upstream_loss_is_fatal_to_the_tunnel() {
    let controller = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handle = tokio::spawn(tunnel::run(TunnelConfig {
        listen: "127.0.0.1:19714".to_string(),
        controller: controller.local_addr().unwrap().to_string(),
        echo_interval: Duration::from_secs(60),
    }));
    sleep(Duration::from_millis(100)).await;

    let upstream = TcpStream::connect("127.0.0.1:19714").await.unwrap();
    sleep(Duration::from_millis(100)).await;
    drop(upstream);

    let outcome = timeout(WAIT, handle)
        .await
        .expect("tunnel did not shut down")
        .unwrap();
    assert!(outcome.is_err(), "upstream loss must be fatal");
}
