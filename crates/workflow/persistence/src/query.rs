use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use workflow_types::{WorkflowDefinitionId, WorkflowInstance, WorkflowStatus};

/// Generic query window for paged reads.
///
/// A `limit` of zero means no limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWindow {
    pub offset: usize,
    pub limit: usize,
}

impl QueryWindow {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        if self.limit == 0 {
            iter.collect()
        } else {
            iter.take(self.limit).collect()
        }
    }
}

/// Read-only filter over stored instances.
///
/// Unset fields match everything. `created_from` is inclusive and
/// `created_to` exclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<WorkflowDefinitionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub window: QueryWindow,
}

impl InstanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_definition(mut self, definition_id: WorkflowDefinitionId) -> Self {
        self.definition_id = Some(definition_id);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self.created_to = Some(to);
        self
    }

    pub fn with_window(mut self, window: QueryWindow) -> Self {
        self.window = window;
        self
    }

    /// An empty creation range cannot match anything and is rejected.
    pub fn validate(&self) -> Result<(), String> {
        match (self.created_from, self.created_to) {
            (Some(from), Some(to)) if from > to => Err(format!(
                "created_from {from} is after created_to {to}"
            )),
            _ => Ok(()),
        }
    }

    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.status.map_or(true, |s| instance.status == s)
            && self
                .definition_id
                .as_ref()
                .map_or(true, |d| &instance.workflow_definition_id == d)
            && self
                .reference
                .as_deref()
                .map_or(true, |r| instance.reference.as_deref() == Some(r))
            && self.created_from.map_or(true, |from| instance.create_time >= from)
            && self.created_to.map_or(true, |to| instance.create_time < to)
    }
}

/// Order for filtered listings: oldest first, ties by id.
pub(crate) fn by_create_time(a: &WorkflowInstance, b: &WorkflowInstance) -> Ordering {
    a.create_time
        .cmp(&b.create_time)
        .then_with(|| a.id.cmp(&b.id))
}

/// Order for runnable snapshots: earliest due first, ties by id.
pub(crate) fn by_next_execution(a: &WorkflowInstance, b: &WorkflowInstance) -> Ordering {
    a.next_execution
        .cmp(&b.next_execution)
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn instance(definition: &str) -> WorkflowInstance {
        WorkflowInstance::new(WorkflowDefinitionId::new(definition))
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = InstanceFilter::new();
        assert!(filter.matches(&instance("a")));

        let mut suspended = instance("b");
        suspended.suspend();
        assert!(filter.matches(&suspended));
    }

    #[test]
    fn test_filter_fields() {
        let now = Utc::now();
        let inst = instance("orders")
            .with_reference("order-1")
            .with_create_time(now);

        assert!(InstanceFilter::new()
            .with_status(WorkflowStatus::Runnable)
            .matches(&inst));
        assert!(!InstanceFilter::new()
            .with_status(WorkflowStatus::Complete)
            .matches(&inst));
        assert!(InstanceFilter::new()
            .with_definition(WorkflowDefinitionId::new("orders"))
            .matches(&inst));
        assert!(!InstanceFilter::new()
            .with_definition(WorkflowDefinitionId::new("billing"))
            .matches(&inst));
        assert!(InstanceFilter::new()
            .with_reference("order-1")
            .matches(&inst));
        assert!(!InstanceFilter::new()
            .with_reference("order-2")
            .matches(&inst));
    }

    #[test]
    fn test_created_range_bounds() {
        let now = Utc::now();
        let inst = instance("a").with_create_time(now);

        assert!(InstanceFilter::new()
            .created_between(now, now + Duration::seconds(1))
            .matches(&inst));
        assert!(!InstanceFilter::new()
            .created_between(now - Duration::seconds(1), now)
            .matches(&inst));
    }

    #[test]
    fn test_validate_inverted_range() {
        let now = Utc::now();
        let filter = InstanceFilter::new().created_between(now, now - Duration::seconds(1));
        assert!(filter.validate().is_err());
        assert!(InstanceFilter::new().validate().is_ok());
    }

    #[test]
    fn test_window() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(QueryWindow::default().apply(items.clone()).len(), 10);
        assert_eq!(QueryWindow::new(2, 3).apply(items.clone()), vec![2, 3, 4]);
        assert_eq!(QueryWindow::new(8, 0).apply(items.clone()), vec![8, 9]);
        assert!(QueryWindow::new(20, 5).apply(items).is_empty());
    }
}
