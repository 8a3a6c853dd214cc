//! # OpenFlow 1.3 Wire Primitives
//!
//! The proxy treats OpenFlow messages as opaque byte sequences and only ever
//! interprets the fixed 8-byte header plus a handful of well-known offsets:
//! the datapath id in FEATURES_REPLY, the role field in ROLE_REPLY, the MORE
//! flag in MULTIPART_REPLY and the ethertype of the frame encapsulated in a
//! PACKET_IN. Everything in this module operates on immutable byte slices;
//! message bodies are never decoded.
//!
//! All multi-byte fields are big-endian per the OpenFlow specification.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::MuxError;

/// Protocol version carried by every message this proxy speaks (OpenFlow 1.3).
pub const OFP_VERSION: u8 = 4;

/// Size of the fixed OpenFlow header.
pub const HEADER_LEN: usize = 8;

/// Message type constants for the subset of OpenFlow 1.3 the proxy dispatches on.
pub mod types {
    pub const HELLO: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const ECHO_REQUEST: u8 = 2;
    pub const ECHO_REPLY: u8 = 3;
    pub const FEATURES_REQUEST: u8 = 5;
    pub const FEATURES_REPLY: u8 = 6;
    pub const GET_CONFIG_REQUEST: u8 = 7;
    pub const GET_CONFIG_REPLY: u8 = 8;
    pub const PACKET_IN: u8 = 10;
    pub const PACKET_OUT: u8 = 13;
    pub const MULTIPART_REQUEST: u8 = 18;
    pub const MULTIPART_REPLY: u8 = 19;
    pub const BARRIER_REQUEST: u8 = 20;
    pub const BARRIER_REPLY: u8 = 21;
    pub const ROLE_REQUEST: u8 = 24;
    pub const ROLE_REPLY: u8 = 25;
    pub const GET_ASYNC_REQUEST: u8 = 26;
    pub const GET_ASYNC_REPLY: u8 = 27;
}

/// Controller request types that solicit a switch reply. A matching entry is
/// recorded in the correlation table when one of these passes downstream.
pub const CONTROLLER_REQUEST_TYPES: [u8; 6] = [
    types::FEATURES_REQUEST,
    types::GET_CONFIG_REQUEST,
    types::MULTIPART_REQUEST,
    types::BARRIER_REQUEST,
    types::ROLE_REQUEST,
    types::GET_ASYNC_REQUEST,
];

/// Switch reply types that resolve against a recorded controller request.
/// Each pairs with the request type numerically one below it.
pub const SWITCH_REPLY_TYPES: [u8; 6] = [
    types::FEATURES_REPLY,
    types::GET_CONFIG_REPLY,
    types::MULTIPART_REPLY,
    types::BARRIER_REPLY,
    types::ROLE_REPLY,
    types::GET_ASYNC_REPLY,
];

/// The fixed OpenFlow header: `version, type, length, xid`, big-endian.
///
/// `length` is the total message size including these 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: u8,
    pub length: u16,
    pub xid: u32,
}

impl Header {
    /// Parse the header from the first 8 bytes of `buf`.
    ///
    /// Fails when fewer than 8 bytes are available, when the version is not
    /// OpenFlow 1.3, or when the claimed length is smaller than the header
    /// itself; each of these signals a peer this proxy cannot stay in sync
    /// with, and the session carrying it must be closed.
    pub fn parse(buf: &[u8]) -> Result<Self, MuxError> {
        if buf.len() < HEADER_LEN {
            return Err(MuxError::Framing(format!(
                "short header: {} bytes",
                buf.len()
            )));
        }
        if buf[0] != OFP_VERSION {
            return Err(MuxError::Framing(format!(
                "unexpected version {}, want {}",
                buf[0], OFP_VERSION
            )));
        }
        let length = u16::from_be_bytes([buf[2], buf[3]]);
        if (length as usize) < HEADER_LEN {
            return Err(MuxError::Framing(format!(
                "claimed length {} below header size",
                length
            )));
        }
        Ok(Self {
            version: buf[0],
            msg_type: buf[1],
            length,
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// Draw a transaction id for a proxy-synthesized message.
///
/// Uniform over the 32-bit space minus 0 and 1; the two lowest values are
/// reserved so proxy-originated traffic is easy to filter out of captures.
pub fn fresh_xid() -> u32 {
    rand::thread_rng().gen_range(2..=u32::MAX)
}

/// Build a control message with the given type, xid and body.
///
/// Used for everything the proxy fabricates itself: HELLO, ECHO_REPLY and
/// FEATURES_REQUEST. The version is always 4 and the length field covers
/// header plus body.
pub fn control_message(msg_type: u8, xid: u32, body: &[u8]) -> Bytes {
    let total = HEADER_LEN + body.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(OFP_VERSION);
    buf.put_u8(msg_type);
    buf.put_u16(total as u16);
    buf.put_u32(xid);
    buf.put_slice(body);
    buf.freeze()
}

/// Datapath id of a FEATURES_REPLY, the u64 immediately after the header.
pub fn features_reply_dpid(msg: &[u8]) -> Option<u64> {
    let raw = msg.get(HEADER_LEN..HEADER_LEN + 8)?;
    Some(u64::from_be_bytes(raw.try_into().ok()?))
}

/// Whether a MULTIPART_REPLY carries the MORE flag (further fragments follow).
///
/// The flags word sits at bytes [10..12) of the message; bit 0 is
/// OFPMPF_REPLY_MORE.
pub fn multipart_has_more(msg: &[u8]) -> bool {
    match msg.get(10..12) {
        Some(raw) => u16::from_be_bytes([raw[0], raw[1]]) & 0x0001 != 0,
        None => false,
    }
}

/// Role value carried in a ROLE_REPLY body, the u32 after the header.
pub fn role_reply_role(msg: &[u8]) -> Option<u32> {
    let raw = msg.get(HEADER_LEN..HEADER_LEN + 4)?;
    Some(u32::from_be_bytes(raw.try_into().ok()?))
}

/// Byte offset of the encapsulated frame's ethertype inside a PACKET_IN:
/// 8 header + 16 packet_in fixed fields + 16 single-OXM match + 2 pad +
/// 12 Ethernet addresses.
const PACKET_IN_ETHERTYPE_OFFSET: usize = 54;

const ETHERTYPE_LLDP: u16 = 0x88cc;
const ETHERTYPE_ARP: u16 = 0x0806;

/// Classify a PACKET_IN as a topology packet (LLDP or ARP payload).
///
/// Topology packets bypass the scheduling policy and go to the master
/// controller. Messages too short to hold the ethertype are not topology.
pub fn is_topology_packet(msg: &[u8]) -> bool {
    match msg.get(PACKET_IN_ETHERTYPE_OFFSET..PACKET_IN_ETHERTYPE_OFFSET + 2) {
        Some(raw) => {
            let ethertype = u16::from_be_bytes([raw[0], raw[1]]);
            ethertype == ETHERTYPE_LLDP || ethertype == ETHERTYPE_ARP
        }
        None => false,
    }
}
