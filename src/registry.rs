//! The dispatcher's view of every unit it has heard from.

use std::sync::{Condvar, Mutex};

use crate::protocol::UnitReply;
use crate::transport::Address;
use crate::types::{TaskId, UnitId};

/// Coarse unit state inferred from the messages the dispatcher sees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    Idle,
    /// Holding (or about to receive) a fire: en route, dropping or refilling.
    Assigned,
    /// Reported completion; acknowledgment in progress.
    Complete,
    Faulted,
}

/// One registry record per unit id.
#[derive(Debug, Clone)]
pub struct UnitStatus {
    pub unit_id: UnitId,
    pub address: Address<UnitReply>,
    pub state: UnitState,
    pub current_task: Option<TaskId>,
}

/// Snapshot row without the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitSummary {
    pub unit_id: UnitId,
    pub state: UnitState,
    pub current_task: Option<TaskId>,
}

/// Unit registry with a wait-for-idle primitive.
pub struct UnitRegistry {
    state: Mutex<RegistryState>,
    idle: Condvar,
}

struct RegistryState {
    units: Vec<UnitStatus>,
    closed: bool,
}

impl RegistryState {
    fn find_mut(&mut self, unit: UnitId) -> Option<&mut UnitStatus> {
        self.units.iter_mut().find(|status| status.unit_id == unit)
    }
}

/// An idle unit reserved by [`UnitRegistry::acquire_idle`].
#[derive(Debug, Clone)]
pub struct Reservation {
    pub unit_id: UnitId,
    pub address: Address<UnitReply>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                units: Vec::new(),
                closed: false,
            }),
            idle: Condvar::new(),
        }
    }

    /// Record that `unit` is ready for work, registering it on first
    /// contact. Returns `true` if the unit was new.
    ///
    /// A unit already `Assigned` keeps that state: its assignment is in
    /// flight and the announcement crossed it.
    pub fn mark_idle(&self, unit: UnitId, address: Address<UnitReply>) -> bool {
        let mut guard = self.state.lock().expect("registry mutex poisoned");
        let registered = match guard.find_mut(unit) {
            Some(status) => {
                status.address = address;
                if status.state != UnitState::Assigned {
                    status.state = UnitState::Idle;
                    status.current_task = None;
                }
                false
            }
            None => {
                guard.units.push(UnitStatus {
                    unit_id: unit,
                    address,
                    state: UnitState::Idle,
                    current_task: None,
                });
                true
            }
        };
        self.idle.notify_all();
        registered
    }

    /// Wait for any idle unit, mark it `Assigned` and hand it out. The scan
    /// and the state change happen under one lock, so two callers never
    /// reserve the same unit. Returns `None` once the registry is closed.
    pub fn acquire_idle(&self) -> Option<Reservation> {
        let mut guard = self.state.lock().expect("registry mutex poisoned");
        loop {
            if guard.closed {
                return None;
            }
            if let Some(status) = guard
                .units
                .iter_mut()
                .find(|status| status.state == UnitState::Idle)
            {
                status.state = UnitState::Assigned;
                return Some(Reservation {
                    unit_id: status.unit_id,
                    address: status.address.clone(),
                });
            }
            guard = self.idle.wait(guard).expect("condvar wait failed");
        }
    }

    /// Put a reservation back without assigning anything.
    pub fn release(&self, unit: UnitId) {
        self.set_state(unit, UnitState::Idle);
    }

    /// Overwrite the state of a known unit; unknown ids are ignored.
    pub fn set_state(&self, unit: UnitId, state: UnitState) -> bool {
        let mut guard = self.state.lock().expect("registry mutex poisoned");
        let Some(status) = guard.find_mut(unit) else {
            return false;
        };
        status.state = state;
        if state != UnitState::Assigned {
            status.current_task = None;
        }
        if state == UnitState::Idle {
            self.idle.notify_all();
        }
        true
    }

    pub fn set_current_task(&self, unit: UnitId, task: Option<TaskId>) {
        let mut guard = self.state.lock().expect("registry mutex poisoned");
        if let Some(status) = guard.find_mut(unit) {
            status.current_task = task;
        }
    }

    /// Register a unit whose first message was not an idle announcement.
    pub fn ensure_registered(&self, unit: UnitId, address: &Address<UnitReply>, state: UnitState) {
        let mut guard = self.state.lock().expect("registry mutex poisoned");
        if guard.find_mut(unit).is_none() {
            guard.units.push(UnitStatus {
                unit_id: unit,
                address: address.clone(),
                state,
                current_task: None,
            });
        }
    }

    pub fn state_of(&self, unit: UnitId) -> Option<UnitState> {
        let guard = self.state.lock().expect("registry mutex poisoned");
        guard
            .units
            .iter()
            .find(|status| status.unit_id == unit)
            .map(|status| status.state)
    }

    /// Units that are not faulted.
    pub fn healthy_count(&self) -> usize {
        let guard = self.state.lock().expect("registry mutex poisoned");
        guard
            .units
            .iter()
            .filter(|status| status.state != UnitState::Faulted)
            .count()
    }

    pub fn snapshot(&self) -> Vec<UnitSummary> {
        let guard = self.state.lock().expect("registry mutex poisoned");
        guard
            .units
            .iter()
            .map(|status| UnitSummary {
                unit_id: status.unit_id,
                state: status.state,
                current_task: status.current_task,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("registry mutex poisoned").units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake and refuse every pending `acquire_idle`.
    pub fn close(&self) {
        let mut guard = self.state.lock().expect("registry mutex poisoned");
        guard.closed = true;
        self.idle.notify_all();
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn address() -> Address<UnitReply> {
        // Mailbox dropped: registry tests never deliver anything.
        channel().0
    }

    #[test]
    fn first_contact_registers_once() {
        let registry = UnitRegistry::new();
        assert!(registry.mark_idle(100, address()));
        assert!(!registry.mark_idle(100, address()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state_of(100), Some(UnitState::Idle));
    }

    #[test]
    fn acquire_marks_unit_assigned() {
        let registry = UnitRegistry::new();
        registry.mark_idle(100, address());
        let reservation = registry.acquire_idle().expect("idle unit");
        assert_eq!(reservation.unit_id, 100);
        assert_eq!(registry.state_of(100), Some(UnitState::Assigned));
    }

    #[test]
    fn idle_announcement_does_not_clobber_assignment_in_flight() {
        let registry = UnitRegistry::new();
        registry.mark_idle(1, address());
        registry.acquire_idle().expect("idle unit");
        registry.set_current_task(1, Some(9));
        registry.mark_idle(1, address());
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].state, UnitState::Assigned);
        assert_eq!(snapshot[0].current_task, Some(9));
    }

    #[test]
    fn first_idle_unit_is_picked() {
        let registry = UnitRegistry::new();
        registry.mark_idle(1, address());
        registry.mark_idle(2, address());
        registry.set_state(1, UnitState::Faulted);
        assert_eq!(registry.acquire_idle().map(|r| r.unit_id), Some(2));
        assert_eq!(registry.healthy_count(), 1);
    }

    #[test]
    fn acquire_waits_for_idle_announcement() {
        let registry = Arc::new(UnitRegistry::new());
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                tx.send(registry.acquire_idle().map(|r| r.unit_id))
                    .expect("send");
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        registry.mark_idle(7, address());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).expect("unit"), Some(7));
        waiter.join().expect("waiter panicked");
    }

    #[test]
    fn concurrent_acquirers_never_share_a_unit() {
        let registry = Arc::new(UnitRegistry::new());
        let units = 6;
        for unit in 0..units {
            registry.mark_idle(unit, address());
        }
        let barrier = Arc::new(Barrier::new(units as usize));
        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        for _ in 0..units {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let reservation = registry.acquire_idle().expect("idle unit");
                tx.send(reservation.unit_id).expect("send");
            }));
        }
        let mut seen = HashSet::new();
        for _ in 0..units {
            let unit = rx.recv_timeout(Duration::from_secs(1)).expect("unit");
            assert!(seen.insert(unit), "unit {unit} handed out twice");
        }
        for handle in handles {
            handle.join().expect("acquirer panicked");
        }
    }

    #[test]
    fn close_unblocks_acquire() {
        let registry = Arc::new(UnitRegistry::new());
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                tx.send(registry.acquire_idle().is_none()).expect("send");
            })
        };
        thread::sleep(Duration::from_millis(20));
        registry.close();
        assert!(rx.recv_timeout(Duration::from_secs(1)).expect("closed"));
        waiter.join().expect("waiter panicked");
    }

    #[test]
    fn set_state_on_unknown_unit_is_ignored() {
        let registry = UnitRegistry::new();
        assert!(!registry.set_state(5, UnitState::Idle));
        assert!(registry.is_empty());
    }
}
