//! Per-instance optimistic concurrency control.
//!
//! Every stored instance lives in its own slot guarded by its own mutex.
//! The slot map is sharded, and a shard guard is never held while a slot
//! lock is taken, so writers on different ids never wait on each other.
//! Writers on the same id serialize on the slot lock for the length of a
//! compare, a clone and a swap; the loser of a race then sees the advanced
//! version and is rejected with a conflict.

use crate::{PersistenceError, PersistenceResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
use workflow_types::{WorkflowInstance, WorkflowInstanceId, INITIAL_VERSION};

type Slot = Arc<Mutex<WorkflowInstance>>;

/// Apply the version rule for one write.
///
/// Returns the version the record takes if the write is accepted.
pub fn check_and_advance(
    id: &WorkflowInstanceId,
    expected: u64,
    stored: u64,
) -> PersistenceResult<u64> {
    if stored < INITIAL_VERSION {
        return Err(PersistenceError::Corruption {
            id: id.clone(),
            reason: format!("stored version {stored} is below the initial version"),
        });
    }
    if expected != stored {
        return Err(PersistenceError::ConcurrencyConflict {
            id: id.clone(),
            expected,
            actual: stored,
        });
    }
    stored
        .checked_add(1)
        .ok_or_else(|| PersistenceError::Corruption {
            id: id.clone(),
            reason: "version counter exhausted".to_string(),
        })
}

/// Owns the stored records and serializes writers per instance id.
#[derive(Debug)]
pub struct ConcurrencyController {
    slots: DashMap<WorkflowInstanceId, Slot>,
    lock_timeout: Duration,
}

impl ConcurrencyController {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            lock_timeout,
        }
    }

    pub fn with_capacity(capacity: usize, lock_timeout: Duration) -> Self {
        Self {
            slots: DashMap::with_capacity(capacity),
            lock_timeout,
        }
    }

    /// `shard_amount` must be a power of two greater than one.
    pub fn with_capacity_and_shard_amount(
        capacity: usize,
        shard_amount: usize,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            slots: DashMap::with_capacity_and_shard_amount(capacity, shard_amount),
            lock_timeout,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store a record under an id that must not exist yet.
    pub fn insert_new(&self, record: WorkflowInstance) -> PersistenceResult<()> {
        match self.slots.entry(record.id.clone()) {
            Entry::Occupied(entry) => Err(PersistenceError::DuplicateId(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(record)));
                Ok(())
            }
        }
    }

    /// A committed copy of the record.
    pub fn read(&self, id: &WorkflowInstanceId) -> PersistenceResult<WorkflowInstance> {
        let slot = self.slot(id)?;
        let guard = self.lock(id, &slot)?;
        verify(id, &guard)?;
        Ok(guard.clone())
    }

    /// Replace the stored record with `incoming` if its version matches.
    ///
    /// The stored id and create time are kept. Returns the new version.
    pub fn compare_and_swap(&self, incoming: &WorkflowInstance) -> PersistenceResult<u64> {
        let id = &incoming.id;
        let slot = self.slot(id)?;
        let mut guard = self.lock(id, &slot)?;
        verify(id, &guard)?;

        let next = match check_and_advance(id, incoming.version, guard.version) {
            Ok(next) => next,
            Err(err) => {
                if err.is_fatal() {
                    tracing::error!(instance_id = %id, error = %err, "version check found corruption");
                } else {
                    tracing::warn!(
                        instance_id = %id,
                        expected = incoming.version,
                        actual = guard.version,
                        "rejected stale write"
                    );
                }
                return Err(err);
            }
        };

        let mut replacement = incoming.clone();
        replacement.version = next;
        replacement.create_time = guard.create_time;
        *guard = replacement;
        Ok(next)
    }

    /// Committed copies of every record matching `keep`.
    ///
    /// Each record is read under its own lock; the result is not a
    /// point-in-time view across instances.
    pub fn snapshot_where<F>(&self, mut keep: F) -> PersistenceResult<Vec<WorkflowInstance>>
    where
        F: FnMut(&WorkflowInstance) -> bool,
    {
        let slots: Vec<(WorkflowInstanceId, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut matched = Vec::new();
        for (id, slot) in slots {
            let guard = self.lock(&id, &slot)?;
            verify(&id, &guard)?;
            if keep(&guard) {
                matched.push(guard.clone());
            }
        }
        Ok(matched)
    }

    fn slot(&self, id: &WorkflowInstanceId) -> PersistenceResult<Slot> {
        self.slots
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PersistenceError::NotFound(id.clone()))
    }

    fn lock<'a>(
        &self,
        id: &WorkflowInstanceId,
        slot: &'a Slot,
    ) -> PersistenceResult<MutexGuard<'a, WorkflowInstance>> {
        slot.try_lock_for(self.lock_timeout).ok_or_else(|| {
            tracing::warn!(
                instance_id = %id,
                timeout_ms = self.lock_timeout.as_millis() as u64,
                "timed out waiting for instance lock"
            );
            PersistenceError::TransientIo(format!(
                "timed out after {:?} waiting for instance {id}",
                self.lock_timeout
            ))
        })
    }
}

fn verify(id: &WorkflowInstanceId, record: &WorkflowInstance) -> PersistenceResult<()> {
    if record.id != *id {
        tracing::error!(instance_id = %id, stored_id = %record.id, "stored record under wrong key");
        return Err(PersistenceError::Corruption {
            id: id.clone(),
            reason: format!("record stored under {id} carries id {}", record.id),
        });
    }
    if record.version < INITIAL_VERSION {
        tracing::error!(instance_id = %id, version = record.version, "stored version below initial");
        return Err(PersistenceError::Corruption {
            id: id.clone(),
            reason: format!("stored version {} is below the initial version", record.version),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Barrier;
    use workflow_types::WorkflowDefinitionId;

    fn stored(id: &str) -> WorkflowInstance {
        let mut record = WorkflowInstance::new(WorkflowDefinitionId::new("def"));
        record.id = WorkflowInstanceId::new(id);
        record.version = INITIAL_VERSION;
        record
    }

    fn controller() -> ConcurrencyController {
        ConcurrencyController::new(Duration::from_millis(250))
    }

    #[test]
    fn test_check_and_advance() {
        let id = WorkflowInstanceId::new("wf-1");
        assert_eq!(check_and_advance(&id, 1, 1).unwrap(), 2);
        assert!(matches!(
            check_and_advance(&id, 1, 2),
            Err(PersistenceError::ConcurrencyConflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));
        assert!(matches!(
            check_and_advance(&id, 0, 0),
            Err(PersistenceError::Corruption { .. })
        ));
        assert!(matches!(
            check_and_advance(&id, u64::MAX, u64::MAX),
            Err(PersistenceError::Corruption { .. })
        ));
    }

    #[test]
    fn test_insert_duplicate() {
        let controller = controller();
        controller.insert_new(stored("wf-1")).unwrap();

        let result = controller.insert_new(stored("wf-1"));
        assert!(matches!(result, Err(PersistenceError::DuplicateId(_))));
        assert_eq!(controller.len(), 1);
    }

    #[test]
    fn test_swap_advances_and_keeps_create_time() {
        let controller = controller();
        let original = stored("wf-1");
        controller.insert_new(original.clone()).unwrap();

        let mut update = original.clone();
        update.next_execution = Some(7);
        update.create_time = original.create_time + chrono::Duration::days(1);

        assert_eq!(controller.compare_and_swap(&update).unwrap(), 2);

        let current = controller.read(&original.id).unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.next_execution, Some(7));
        assert_eq!(current.create_time, original.create_time);
    }

    #[test]
    fn test_stale_swap_rejected() {
        let controller = controller();
        let original = stored("wf-1");
        controller.insert_new(original.clone()).unwrap();
        controller.compare_and_swap(&original).unwrap();

        let result = controller.compare_and_swap(&original);
        assert!(matches!(
            result,
            Err(PersistenceError::ConcurrencyConflict { .. })
        ));
        assert_eq!(controller.read(&original.id).unwrap().version, 2);
    }

    #[test]
    fn test_unknown_id() {
        let controller = controller();
        let missing = stored("missing");
        assert!(matches!(
            controller.read(&missing.id),
            Err(PersistenceError::NotFound(_))
        ));
        assert!(matches!(
            controller.compare_and_swap(&missing),
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[test]
    fn test_corrupted_record_surfaces() {
        let controller = controller();
        let mut record = stored("wf-1");
        record.version = 0;
        controller.insert_new(record.clone()).unwrap();

        assert!(matches!(
            controller.read(&record.id),
            Err(PersistenceError::Corruption { .. })
        ));
        assert!(matches!(
            controller.snapshot_where(|_| true),
            Err(PersistenceError::Corruption { .. })
        ));
    }

    #[test]
    fn test_held_lock_times_out() {
        let controller = ConcurrencyController::new(Duration::from_millis(20));
        let record = stored("wf-1");
        controller.insert_new(record.clone()).unwrap();

        let slot = controller.slot(&record.id).unwrap();
        let _held = slot.lock();

        assert!(matches!(
            controller.read(&record.id),
            Err(PersistenceError::TransientIo(_))
        ));
    }

    #[test]
    fn test_held_lock_does_not_block_other_ids() {
        let controller = ConcurrencyController::new(Duration::from_millis(20));
        controller.insert_new(stored("wf-1")).unwrap();
        controller.insert_new(stored("wf-2")).unwrap();

        let slot = controller.slot(&WorkflowInstanceId::new("wf-1")).unwrap();
        let _held = slot.lock();

        let other = stored("wf-2");
        assert_eq!(controller.compare_and_swap(&other).unwrap(), 2);
    }

    #[test]
    fn test_racing_threads_one_winner() {
        let controller = Arc::new(controller());
        let record = stored("wf-1");
        controller.insert_new(record.clone()).unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let controller = Arc::clone(&controller);
                let barrier = Arc::clone(&barrier);
                let attempt = record.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    controller.compare_and_swap(&attempt)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, PersistenceError::ConcurrencyConflict { .. })));
        assert_eq!(controller.read(&record.id).unwrap().version, 2);
    }

    proptest! {
        #[test]
        fn prop_version_rule(expected in 0u64..64, stored_version in 0u64..64) {
            let id = WorkflowInstanceId::new("wf");
            match check_and_advance(&id, expected, stored_version) {
                Ok(next) => {
                    prop_assert!(stored_version >= INITIAL_VERSION);
                    prop_assert_eq!(expected, stored_version);
                    prop_assert_eq!(next, stored_version + 1);
                }
                Err(PersistenceError::ConcurrencyConflict { expected: e, actual, .. }) => {
                    prop_assert!(stored_version >= INITIAL_VERSION);
                    prop_assert_ne!(e, actual);
                }
                Err(PersistenceError::Corruption { .. }) => {
                    prop_assert!(stored_version < INITIAL_VERSION);
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }
}
