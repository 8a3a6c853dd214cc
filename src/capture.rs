//! # Message Capture Stream
//!
//! Optional append-only recording of data-plane traffic for off-line latency
//! analysis. Each forwarded PACKET_IN and each received PACKET_OUT is
//! appended as a flat binary record:
//!
//! ```text
//! f64 timestamp_seconds (little-endian)
//! i32 length            (little-endian)
//! length bytes of raw OpenFlow message
//! ```
//!
//! The file is flushed after every record so a post-processor can follow a
//! live capture and nothing is lost on an abrupt exit.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::MuxError;

/// Append-only writer for the capture stream.
#[derive(Debug)]
pub struct CaptureWriter {
    out: BufWriter<File>,
}

impl CaptureWriter {
    /// Open (or create) the capture file for appending.
    pub fn open(path: &Path) -> Result<Self, MuxError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    /// Append one record stamped with the current wall-clock time.
    pub fn record(&mut self, msg: &[u8]) -> Result<(), MuxError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.out.write_all(&timestamp.to_le_bytes())?;
        self.out.write_all(&(msg.len() as i32).to_le_bytes())?;
        self.out.write_all(msg)?;
        self.out.flush()?;
        Ok(())
    }
}
