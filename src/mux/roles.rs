//! # Controller Role Tracking
//!
//! OpenFlow 1.3 lets each controller negotiate a per-switch role of master,
//! slave or equal, with master exclusive per switch (§6.3.5). The switch is
//! the authority; the proxy tracks the last acceptance it has observed so it
//! can route master-only traffic. Only a ROLE_REPLY mutates this table, a
//! request alone changes nothing. When a controller is accepted as master,
//! the previously recorded master (if any) is demoted to slave locally.

use std::collections::HashMap;

use crate::mux::{ControllerId, SwitchId};

/// Role of one controller on one switch. Every association starts as equal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    Equal,
    Master,
    Slave,
}

impl Role {
    /// Decode the role field of a ROLE_REPLY body.
    ///
    /// `None` covers OFPCR_ROLE_NOCHANGE (0) and values outside the
    /// specification, neither of which alters tracked state.
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Role::Equal),
            2 => Some(Role::Master),
            3 => Some(Role::Slave),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RoleTable {
    roles: HashMap<SwitchId, HashMap<ControllerId, Role>>,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current role of `controller` on `switch`. Unrecorded pairs are equal.
    pub fn role(&self, switch: SwitchId, controller: ControllerId) -> Role {
        self.roles
            .get(&switch)
            .and_then(|row| row.get(&controller))
            .copied()
            .unwrap_or_default()
    }

    /// The controller currently recorded as master of `switch`, if any.
    pub fn master(&self, switch: SwitchId) -> Option<ControllerId> {
        self.roles.get(&switch)?.iter().find_map(|(controller, role)| {
            (*role == Role::Master).then_some(*controller)
        })
    }

    /// Record a switch-accepted role change.
    ///
    /// Returns the controller demoted from master when this acceptance
    /// displaces one, so the caller can log the takeover.
    pub fn accept(
        &mut self,
        switch: SwitchId,
        controller: ControllerId,
        role: Role,
    ) -> Option<ControllerId> {
        let row = self.roles.entry(switch).or_default();
        let mut demoted = None;
        if role == Role::Master {
            for (other, held) in row.iter_mut() {
                if *other != controller && *held == Role::Master {
                    *held = Role::Slave;
                    demoted = Some(*other);
                }
            }
        }
        row.insert(controller, role);
        demoted
    }

    /// Forget one controller's role on `switch` (its session ended).
    pub fn remove_controller(&mut self, switch: SwitchId, controller: ControllerId) {
        if let Some(row) = self.roles.get_mut(&switch) {
            row.remove(&controller);
            if row.is_empty() {
                self.roles.remove(&switch);
            }
        }
    }

    /// Drop the whole row for a switch on teardown.
    pub fn purge_switch(&mut self, switch: SwitchId) {
        self.roles.remove(&switch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecorded_pairs_are_equal() {
        let table = RoleTable::new();
        assert_eq!(table.role(1, 10), Role::Equal);
        assert_eq!(table.master(1), None);
    }

    #[test]
    fn master_is_exclusive_per_switch() {
        let mut table = RoleTable::new();
        assert_eq!(table.accept(1, 10, Role::Master), None);
        assert_eq!(table.master(1), Some(10));

        // Takeover demotes the previous master to slave.
        assert_eq!(table.accept(1, 20, Role::Master), Some(10));
        assert_eq!(table.master(1), Some(20));
        assert_eq!(table.role(1, 10), Role::Slave);

        // A second switch is an independent row.
        assert_eq!(table.accept(2, 10, Role::Master), None);
        assert_eq!(table.master(1), Some(20));
        assert_eq!(table.master(2), Some(10));
    }

    #[test]
    fn explicit_slave_acceptance_clears_mastership() {
        let mut table = RoleTable::new();
        table.accept(1, 10, Role::Master);
        table.accept(1, 10, Role::Slave);
        assert_eq!(table.master(1), None);
        assert_eq!(table.role(1, 10), Role::Slave);
    }

    #[test]
    fn removing_the_master_leaves_the_switch_without_one() {
        let mut table = RoleTable::new();
        table.accept(1, 10, Role::Master);
        table.accept(1, 20, Role::Slave);
        table.remove_controller(1, 10);
        assert_eq!(table.master(1), None);
        assert_eq!(table.role(1, 20), Role::Slave);
    }

    #[test]
    fn wire_decoding() {
        assert_eq!(Role::from_wire(0), None);
        assert_eq!(Role::from_wire(1), Some(Role::Equal));
        assert_eq!(Role::from_wire(2), Some(Role::Master));
        assert_eq!(Role::from_wire(3), Some(Role::Slave));
        assert_eq!(Role::from_wire(99), None);
    }
}
