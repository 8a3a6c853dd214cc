//! # PACKET_IN Scheduling
//!
//! Asynchronous switch events that are not topology traffic are spread
//! across the controller pool by a configurable policy. Every policy is
//! stateless across message boundaries except for one integer cursor, so a
//! scheduler can be torn down and rebuilt without affecting correctness.
//!
//! The leg list handed to [`Scheduler::pick`] is the switch's associated
//! controllers in stable insertion order; it shrinks when sessions die and
//! the cursor simply wraps over whatever remains.

use clap::ValueEnum;

use crate::mux::ControllerId;

/// Selectable PACKET_IN scheduling policies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Policy {
    /// Rotate through the leg list one message at a time.
    #[default]
    #[value(name = "round-robin")]
    RoundRobin,
    /// Always the controller currently holding master (round-robin when
    /// no master is recorded).
    #[value(name = "master")]
    Master,
    /// Always the first leg in configured order.
    #[value(name = "first")]
    First,
    /// Round-robin weighted by the per-endpoint weights.
    #[value(name = "weighted")]
    Weighted,
}

/// One scheduling cursor shared by all switches of a proxy process.
#[derive(Debug)]
pub struct Scheduler {
    policy: Policy,
    cursor: usize,
}

impl Scheduler {
    pub fn new(policy: Policy) -> Self {
        Self { policy, cursor: 0 }
    }

    /// Choose the destination leg for one non-topology PACKET_IN.
    ///
    /// `legs` pairs each associated controller with its configured weight in
    /// stable insertion order; `master` is the current master, if any.
    /// Returns `None` only when the leg list is empty.
    pub fn pick(
        &mut self,
        legs: &[(ControllerId, u32)],
        master: Option<ControllerId>,
    ) -> Option<ControllerId> {
        if legs.is_empty() {
            return None;
        }
        match self.policy {
            Policy::First => Some(legs[0].0),
            Policy::Master => match master {
                Some(m) if legs.iter().any(|(id, _)| *id == m) => Some(m),
                _ => Some(self.round_robin(legs)),
            },
            Policy::RoundRobin => Some(self.round_robin(legs)),
            Policy::Weighted => Some(self.weighted(legs)),
        }
    }

    /// Advance the cursor, then select; with a fresh cursor and N legs the
    /// first pick lands on index 1.
    fn round_robin(&mut self, legs: &[(ControllerId, u32)]) -> ControllerId {
        self.cursor = (self.cursor + 1) % legs.len();
        legs[self.cursor].0
    }

    /// The cursor walks the cumulative weight space; a leg with weight w
    /// owns w consecutive cursor values.
    fn weighted(&mut self, legs: &[(ControllerId, u32)]) -> ControllerId {
        let total: usize = legs.iter().map(|(_, w)| (*w).max(1) as usize).sum();
        self.cursor = (self.cursor + 1) % total;
        let mut acc = 0;
        for (id, weight) in legs {
            acc += (*weight).max(1) as usize;
            if self.cursor < acc {
                return *id;
            }
        }
        legs[legs.len() - 1].0
    }
}
