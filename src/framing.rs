//! # Incremental Message Framing
//!
//! TCP delivers byte streams with arbitrary chunk boundaries, so every
//! session owns a framer that accumulates incoming bytes and yields whole
//! messages in arrival order. Two framings exist:
//!
//! - **OpenFlow**: the 8-byte fixed header carries the total message size at
//!   bytes [2..4), big-endian.
//! - **Envelope**: the tunnel pipe prefixes each OpenFlow message with a
//!   10-byte `(dpid: u64, length: u16)` header where `length` is the size of
//!   the OpenFlow message that follows.
//!
//! Both framers are restartable across socket reads and never lose or
//! duplicate bytes. A claimed OpenFlow length below 8 is a fatal framing
//! error; the session that produced it must be closed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::HEADER_LEN;
use crate::MuxError;

/// Size of the `(dpid, length)` envelope header on the tunnel pipe.
pub const ENVELOPE_LEN: usize = 10;

/// Framer for plain OpenFlow byte streams.
#[derive(Debug, Default)]
pub struct OpenFlowFramer {
    buf: BytesMut,
}

impl OpenFlowFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes to the internal buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete message, if the buffer holds one.
    ///
    /// Call in a loop after each `push` until it returns `Ok(None)`. The
    /// returned frame is the whole message, header included.
    pub fn next(&mut self) -> Result<Option<Bytes>, MuxError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        if length < HEADER_LEN {
            return Err(MuxError::Framing(format!(
                "claimed length {} below header size",
                length
            )));
        }
        if self.buf.len() < length {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(length).freeze()))
    }
}

/// Framer for envelope-prefixed streams on the tunnel pipe.
///
/// Yields whole frames including the 10-byte envelope; use [`split_envelope`]
/// to separate the dpid from the enclosed OpenFlow message.
#[derive(Debug, Default)]
pub struct EnvelopeFramer {
    buf: BytesMut,
}

impl EnvelopeFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next(&mut self) -> Result<Option<Bytes>, MuxError> {
        if self.buf.len() < ENVELOPE_LEN {
            return Ok(None);
        }
        let payload = u16::from_be_bytes([self.buf[8], self.buf[9]]) as usize;
        if payload < HEADER_LEN {
            return Err(MuxError::Framing(format!(
                "envelope payload {} below OpenFlow header size",
                payload
            )));
        }
        let total = ENVELOPE_LEN + payload;
        if self.buf.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(total).freeze()))
    }
}

/// Prefix an OpenFlow message with the `(dpid, length)` envelope.
pub fn seal_envelope(dpid: u64, msg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ENVELOPE_LEN + msg.len());
    buf.put_u64(dpid);
    buf.put_u16(msg.len() as u16);
    buf.put_slice(msg);
    buf.freeze()
}

/// Split an envelope frame into its dpid and the enclosed OpenFlow message.
///
/// The frame must be one yielded by [`EnvelopeFramer::next`]; the split is
/// zero-copy.
pub fn split_envelope(frame: &Bytes) -> Result<(u64, Bytes), MuxError> {
    if frame.len() < ENVELOPE_LEN {
        return Err(MuxError::Framing(format!(
            "short envelope frame: {} bytes",
            frame.len()
        )));
    }
    let dpid = u64::from_be_bytes(frame[..8].try_into().unwrap_or_default());
    Ok((dpid, frame.slice(ENVELOPE_LEN..)))
}
