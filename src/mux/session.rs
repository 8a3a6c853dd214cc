//! # Session Plumbing
//!
//! One TCP connection is handled by two tasks: a reader that feeds the
//! session's framer in arrival order, and a writer that drains an unbounded
//! queue of complete frames. The queue is the serialization point required
//! by the concurrency model: two messages destined for the same peer can
//! never interleave bytes because only the writer task touches the socket.
//!
//! Write handles are created before the underlying connection exists, so a
//! dialed leg can be registered (and targeted by dispatch) while the TCP
//! connect is still in flight; frames enqueued in the meantime flow out as
//! soon as the writer task starts. Queued frames on a session that closes
//! are discarded, never retried.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::wire::{control_message, fresh_xid, types};

/// Commands consumed by a session's writer task.
#[derive(Debug)]
pub enum WriteCmd {
    /// Write one complete frame to the socket.
    Frame(Bytes),
    /// Stop draining and drop the socket, discarding anything still queued.
    Shutdown,
}

/// Cloneable sending side of a session's write queue.
#[derive(Clone, Debug)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<WriteCmd>,
}

impl WriteHandle {
    /// Create a handle together with the receiver its writer task will drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WriteCmd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue one frame. Returns `false` when the session is already gone;
    /// the frame is dropped in that case, matching the no-retry policy.
    pub fn send(&self, frame: Bytes) -> bool {
        self.tx.send(WriteCmd::Frame(frame)).is_ok()
    }

    /// Ask the writer task to close the session.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WriteCmd::Shutdown);
    }
}

/// Drain the write queue into the socket until shutdown, queue closure or a
/// write error. Dropping the write half sends FIN.
pub async fn run_writer(mut stream: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<WriteCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCmd::Frame(frame) => {
                if let Err(e) = stream.write_all(&frame).await {
                    debug!(error = %e, "session write failed, closing");
                    break;
                }
                trace!(bytes = frame.len(), "frame written");
            }
            WriteCmd::Shutdown => break,
        }
    }
}

/// Emit a keepalive ECHO_REQUEST on `handle` every `period` until the
/// session goes away. A missing ECHO_REPLY is not acted upon; a dead peer
/// is eventually surfaced by TCP itself.
pub fn spawn_echo_ticker(handle: WriteHandle, period: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // the first tick fires immediately, skip it
        loop {
            tick.tick().await;
            let echo = control_message(types::ECHO_REQUEST, fresh_xid(), &[]);
            if !handle.send(echo) {
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_shutdown_reports_closed_once_receiver_drops() {
        let (handle, rx) = WriteHandle::channel();
        assert!(handle.send(Bytes::from_static(b"ok")));
        drop(rx);
        assert!(!handle.send(Bytes::from_static(b"dropped")));
    }

    #[tokio::test]
    async fn writer_stops_on_shutdown_and_discards_queue() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (handle, rx) = WriteHandle::channel();
        let (_, write_half) = client.into_split();
        let writer = tokio::spawn(run_writer(write_half, rx));

        handle.send(Bytes::from_static(b"before"));
        handle.shutdown();
        handle.send(Bytes::from_static(b"after"));
        writer.await.unwrap();

        // The peer sees everything queued before the shutdown, then EOF.
        let mut received = Vec::new();
        let mut server = server;
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut received)
            .await
            .unwrap();
        assert_eq!(received, b"before");
    }

    #[tokio::test(start_paused = true)]
    async fn echo_ticker_emits_well_formed_requests() {
        let (handle, mut rx) = WriteHandle::channel();
        spawn_echo_ticker(handle, Duration::from_secs(5));

        // Paused time auto-advances through the ticker's timers.
        tokio::time::sleep(Duration::from_secs(12)).await;
        let mut seen = 0;
        while let Ok(cmd) = rx.try_recv() {
            let WriteCmd::Frame(frame) = cmd else {
                panic!("unexpected shutdown")
            };
            assert_eq!(frame.len(), 8);
            assert_eq!(frame[1], types::ECHO_REQUEST);
            seen += 1;
        }
        assert_eq!(seen, 2);
    }
}
