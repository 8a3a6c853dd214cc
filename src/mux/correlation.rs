//! # Request/Reply Correlation Table
//!
//! OpenFlow replies carry the xid of the request that solicited them, but an
//! xid is only unique per requester. When several controllers issue the same
//! request type with the same xid against one switch, the switch's replies
//! must fan back out in the order the requests went down. The table keys a
//! FIFO queue of waiting controller sessions by `(switch, request type, xid)`.
//!
//! Multipart replies peek instead of pop while their MORE flag is set, so
//! every fragment of one paginated exchange reaches the same controller and
//! no other requester can capture the xid in the interim.

use std::collections::{HashMap, VecDeque};

use crate::mux::{ControllerId, SwitchId};

#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<(SwitchId, u8, u32), VecDeque<ControllerId>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `controller` to the queue awaiting a reply of `request_type`
    /// with `xid` from `switch`.
    pub fn record(
        &mut self,
        switch: SwitchId,
        request_type: u8,
        xid: u32,
        controller: ControllerId,
    ) {
        self.pending
            .entry((switch, request_type, xid))
            .or_default()
            .push_back(controller);
    }

    /// Resolve the controller at the head of the queue.
    ///
    /// With `peek` the head stays queued (multipart fragments with MORE set);
    /// otherwise it is removed and an emptied queue is dropped. `None` means
    /// no controller is waiting, which callers treat as a fatal
    /// desynchronization.
    pub fn resolve(
        &mut self,
        switch: SwitchId,
        request_type: u8,
        xid: u32,
        peek: bool,
    ) -> Option<ControllerId> {
        let key = (switch, request_type, xid);
        let queue = self.pending.get_mut(&key)?;
        let head = if peek {
            queue.front().copied()
        } else {
            queue.pop_front()
        };
        if queue.is_empty() {
            self.pending.remove(&key);
        }
        head
    }

    /// Drop every entry recorded for `switch`. Called on switch teardown.
    pub fn purge_switch(&mut self, switch: SwitchId) {
        self.pending.retain(|(owner, _, _), _| *owner != switch);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
