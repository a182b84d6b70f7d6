//! Execution pointers: step-progress markers owned by a workflow instance
//!
//! An [`ExecutionPointerSet`] is a keyed collection that is only ever
//! persisted together with its owning instance. Enumeration order is
//! unspecified.

use crate::{WorkflowError, WorkflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Pointer Identifier ───────────────────────────────────────────────

/// Identifier of an execution pointer, unique within its owning instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ExecutionPointerId(pub String);

impl ExecutionPointerId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// An empty id asks the set to generate one on insert
    pub fn is_unassigned(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionPointerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Pointer Status ───────────────────────────────────────────────────

/// Progress of the step an execution pointer tracks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PointerStatus {
    /// Created but the step has not started
    #[default]
    Pending,
    /// The step is executing
    Running,
    /// Waiting until `sleep_until`
    Sleeping,
    /// The step finished
    Complete,
    /// The step failed
    Failed,
    /// The pointer was abandoned (e.g. the workflow was terminated)
    Cancelled,
}

impl PointerStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

// ── Execution Pointer ────────────────────────────────────────────────

/// A marker tracking progress at one (active or historical) step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPointer {
    /// Unique within the owning instance
    pub id: ExecutionPointerId,
    /// Index into the workflow definition's step list
    pub step_id: u32,
    /// Display name of the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// Toggled by the execution engine as steps start and finish
    pub active: bool,
    pub status: PointerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    /// The pointer this one was spawned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor_id: Option<ExecutionPointerId>,
}

impl ExecutionPointer {
    /// A pending, inactive pointer with an unassigned id
    pub fn new(step_id: u32) -> Self {
        Self {
            id: ExecutionPointerId::default(),
            step_id,
            step_name: None,
            active: false,
            status: PointerStatus::Pending,
            start_time: None,
            end_time: None,
            sleep_until: None,
            retry_count: 0,
            predecessor_id: None,
        }
    }

    /// An active pointer, the shape the engine uses for a step it is about to run
    pub fn active(step_id: u32) -> Self {
        Self {
            active: true,
            ..Self::new(step_id)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = ExecutionPointerId::new(id);
        self
    }

    pub fn with_step_name(mut self, name: impl Into<String>) -> Self {
        self.step_name = Some(name.into());
        self
    }

    pub fn with_predecessor(mut self, predecessor: ExecutionPointerId) -> Self {
        self.predecessor_id = Some(predecessor);
        self
    }

    pub fn sleep_until(&mut self, until: DateTime<Utc>) {
        self.status = PointerStatus::Sleeping;
        self.sleep_until = Some(until);
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }
}

// ── Pointer Set ──────────────────────────────────────────────────────

/// Keyed collection of execution pointers owned by one instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ExecutionPointerSet {
    pointers: HashMap<ExecutionPointerId, ExecutionPointer>,
}

impl ExecutionPointerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pointer, generating an id if it has none
    pub fn add(&mut self, mut pointer: ExecutionPointer) -> WorkflowResult<ExecutionPointerId> {
        if pointer.id.is_unassigned() {
            pointer.id = ExecutionPointerId::generate();
        }
        if self.pointers.contains_key(&pointer.id) {
            return Err(WorkflowError::DuplicatePointerId(pointer.id));
        }
        let id = pointer.id.clone();
        self.pointers.insert(id.clone(), pointer);
        Ok(id)
    }

    pub fn get(&self, id: &ExecutionPointerId) -> Option<&ExecutionPointer> {
        self.pointers.get(id)
    }

    pub fn get_mut(&mut self, id: &ExecutionPointerId) -> Option<&mut ExecutionPointer> {
        self.pointers.get_mut(id)
    }

    pub fn contains(&self, id: &ExecutionPointerId) -> bool {
        self.pointers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionPointer> {
        self.pointers.values()
    }

    /// Pointers currently marked active
    pub fn active(&self) -> impl Iterator<Item = &ExecutionPointer> {
        self.pointers.values().filter(|p| p.active)
    }

    pub fn any_active(&self) -> bool {
        self.pointers.values().any(|p| p.active)
    }

    /// All pointers (active or historical) for one step
    pub fn for_step(&self, step_id: u32) -> Vec<&ExecutionPointer> {
        self.pointers
            .values()
            .filter(|p| p.step_id == step_id)
            .collect()
    }

    /// Mark a pointer active and running
    pub fn activate(&mut self, id: &ExecutionPointerId) -> WorkflowResult<()> {
        let pointer = self
            .pointers
            .get_mut(id)
            .ok_or_else(|| WorkflowError::PointerNotFound(id.clone()))?;
        pointer.active = true;
        pointer.status = PointerStatus::Running;
        pointer.start_time.get_or_insert_with(Utc::now);
        pointer.end_time = None;
        Ok(())
    }

    /// Mark a pointer inactive with a final status
    pub fn deactivate(
        &mut self,
        id: &ExecutionPointerId,
        status: PointerStatus,
    ) -> WorkflowResult<()> {
        let pointer = self
            .pointers
            .get_mut(id)
            .ok_or_else(|| WorkflowError::PointerNotFound(id.clone()))?;
        pointer.active = false;
        pointer.status = status;
        pointer.end_time = Some(Utc::now());
        Ok(())
    }

    /// Deactivate every active pointer, marking it cancelled
    pub fn deactivate_all(&mut self) -> usize {
        let now = Utc::now();
        let mut count = 0;
        for pointer in self.pointers.values_mut().filter(|p| p.active) {
            pointer.active = false;
            pointer.status = PointerStatus::Cancelled;
            pointer.end_time = Some(now);
            count += 1;
        }
        count
    }
}

impl<'a> IntoIterator for &'a ExecutionPointerSet {
    type Item = &'a ExecutionPointer;
    type IntoIter = std::collections::hash_map::Values<'a, ExecutionPointerId, ExecutionPointer>;

    fn into_iter(self) -> Self::IntoIter {
        self.pointers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_add_generates_id() {
        let mut set = ExecutionPointerSet::new();
        let a = set.add(ExecutionPointer::active(0)).unwrap();
        let b = set.add(ExecutionPointer::active(0)).unwrap();

        assert!(!a.is_unassigned());
        assert_ne!(a, b);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_add_keeps_supplied_id() {
        let mut set = ExecutionPointerSet::new();
        let id = set.add(ExecutionPointer::new(3).with_id("p-1")).unwrap();

        assert_eq!(id, ExecutionPointerId::new("p-1"));
        assert_eq!(set.get(&id).unwrap().step_id, 3);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut set = ExecutionPointerSet::new();
        set.add(ExecutionPointer::new(0).with_id("p-1")).unwrap();

        let result = set.add(ExecutionPointer::new(1).with_id("p-1"));
        assert!(matches!(result, Err(WorkflowError::DuplicatePointerId(_))));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&ExecutionPointerId::new("p-1")).unwrap().step_id, 0);
    }

    #[test]
    fn test_active_enumeration() {
        let mut set = ExecutionPointerSet::new();
        let running = set.add(ExecutionPointer::active(0)).unwrap();
        let idle = set.add(ExecutionPointer::new(1)).unwrap();

        let active: Vec<_> = set.active().map(|p| p.id.clone()).collect();
        assert_eq!(active, vec![running.clone()]);

        set.activate(&idle).unwrap();
        set.deactivate(&running, PointerStatus::Complete).unwrap();

        let active: Vec<_> = set.active().map(|p| p.id.clone()).collect();
        assert_eq!(active, vec![idle.clone()]);
        assert_eq!(set.get(&running).unwrap().status, PointerStatus::Complete);
        assert!(set.get(&running).unwrap().end_time.is_some());
        assert_eq!(set.get(&idle).unwrap().status, PointerStatus::Running);
    }

    #[test]
    fn test_toggle_unknown_pointer() {
        let mut set = ExecutionPointerSet::new();
        let missing = ExecutionPointerId::new("nope");

        assert!(matches!(
            set.activate(&missing),
            Err(WorkflowError::PointerNotFound(_))
        ));
        assert!(matches!(
            set.deactivate(&missing, PointerStatus::Failed),
            Err(WorkflowError::PointerNotFound(_))
        ));
    }

    #[test]
    fn test_deactivate_all() {
        let mut set = ExecutionPointerSet::new();
        set.add(ExecutionPointer::active(0)).unwrap();
        set.add(ExecutionPointer::active(1)).unwrap();
        set.add(ExecutionPointer::new(2)).unwrap();

        assert_eq!(set.deactivate_all(), 2);
        assert!(!set.any_active());
        assert_eq!(
            set.iter()
                .filter(|p| p.status == PointerStatus::Cancelled)
                .count(),
            2
        );
    }

    #[test]
    fn test_for_step() {
        let mut set = ExecutionPointerSet::new();
        let first = set.add(ExecutionPointer::new(4)).unwrap();
        set.add(ExecutionPointer::new(4).with_predecessor(first))
            .unwrap();
        set.add(ExecutionPointer::new(5)).unwrap();

        assert_eq!(set.for_step(4).len(), 2);
        assert_eq!(set.for_step(5).len(), 1);
        assert!(set.for_step(6).is_empty());
    }

    #[test]
    fn test_serializes_as_map() {
        let mut set = ExecutionPointerSet::new();
        set.add(ExecutionPointer::active(0).with_id("p-1")).unwrap();

        let json = serde_json::to_value(&set).unwrap();
        assert!(json.get("p-1").is_some());

        let restored: ExecutionPointerSet = serde_json::from_value(json).unwrap();
        assert_eq!(restored, set);
    }

    proptest! {
        #[test]
        fn prop_active_matches_flags(flags in proptest::collection::vec(any::<bool>(), 0..32)) {
            let mut set = ExecutionPointerSet::new();
            for (step, active) in flags.iter().enumerate() {
                let mut pointer = ExecutionPointer::new(step as u32);
                pointer.active = *active;
                set.add(pointer).unwrap();
            }

            prop_assert_eq!(set.len(), flags.len());
            prop_assert_eq!(set.active().count(), flags.iter().filter(|a| **a).count());
            prop_assert_eq!(set.any_active(), flags.iter().any(|a| *a));
        }
    }
}
