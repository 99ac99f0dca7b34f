//! Per-container operation slots.
//!
//! At most one lifecycle operation may run against a container name at any
//! time. [`OperationTracker::begin`] atomically claims the slot and returns a
//! guard that frees it on drop, so error paths cannot leak a busy state.

use crate::registry::ContainerName;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Creating,
    Deleting,
    Reconfiguring,
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Creating => "creating",
            Operation::Deleting => "deleting",
            Operation::Reconfiguring => "reconfiguring",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("operation `{current}` already in progress on `{name}`")]
pub struct OperationInProgress {
    pub name: ContainerName,
    pub current: Operation,
}

type Slots = Arc<Mutex<HashMap<ContainerName, Operation>>>;

#[derive(Default, Clone)]
pub struct OperationTracker {
    slots: Slots,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot for `name`, failing with the current operation if one
    /// is already running.
    pub fn begin(
        &self,
        name: &ContainerName,
        op: Operation,
    ) -> Result<OperationGuard, OperationInProgress> {
        let mut slots = self.slots.lock().expect("operation tracker lock poisoned");
        if let Some(current) = slots.get(name) {
            return Err(OperationInProgress {
                name: name.clone(),
                current: *current,
            });
        }
        slots.insert(name.clone(), op);
        Ok(OperationGuard {
            slots: self.slots.clone(),
            name: name.clone(),
        })
    }

    pub fn in_progress(&self, name: &ContainerName) -> Option<Operation> {
        self.slots
            .lock()
            .expect("operation tracker lock poisoned")
            .get(name)
            .copied()
    }
}

/// Holds the claimed slot; dropping it returns the container to idle.
#[derive(Debug)]
pub struct OperationGuard {
    slots: Slots,
    name: ContainerName,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.slots
            .lock()
            .expect("operation tracker lock poisoned")
            .remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ContainerName {
        ContainerName::new(s).unwrap()
    }

    #[test]
    fn begin_claims_and_drop_releases() {
        let tracker = OperationTracker::new();
        let guard = tracker.begin(&name("plc-001"), Operation::Creating).unwrap();
        assert_eq!(
            tracker.in_progress(&name("plc-001")),
            Some(Operation::Creating)
        );

        drop(guard);
        assert_eq!(tracker.in_progress(&name("plc-001")), None);
    }

    #[test]
    fn second_begin_on_same_name_is_busy() {
        let tracker = OperationTracker::new();
        let _guard = tracker.begin(&name("plc-001"), Operation::Creating).unwrap();

        let err = tracker
            .begin(&name("plc-001"), Operation::Deleting)
            .unwrap_err();
        assert_eq!(err.current, Operation::Creating);
        assert_eq!(err.name, name("plc-001"));
    }

    #[test]
    fn different_names_do_not_contend() {
        let tracker = OperationTracker::new();
        let _a = tracker.begin(&name("plc-001"), Operation::Creating).unwrap();
        let _b = tracker
            .begin(&name("plc-002"), Operation::Reconfiguring)
            .unwrap();
        assert_eq!(
            tracker.in_progress(&name("plc-002")),
            Some(Operation::Reconfiguring)
        );
    }

    #[test]
    fn slot_is_released_even_when_the_holder_panics() {
        let tracker = OperationTracker::new();
        let cloned = tracker.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.begin(&name("plc-001"), Operation::Deleting).unwrap();
            panic!("operation blew up");
        });
        assert!(result.is_err());
        assert_eq!(tracker.in_progress(&name("plc-001")), None);
    }
}
