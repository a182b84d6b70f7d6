//! Identity allocation for newly created instances.

use std::sync::atomic::{AtomicU64, Ordering};
use workflow_types::WorkflowInstanceId;

/// Produces instance ids at creation time.
///
/// Allocators must be safe to call from many tasks at once and must not hand
/// out the same id twice for the lifetime of a store.
pub trait IdentityAllocator: Send + Sync {
    fn allocate(&self) -> WorkflowInstanceId;
}

/// Random UUID v4 ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidAllocator;

impl IdentityAllocator for UuidAllocator {
    fn allocate(&self) -> WorkflowInstanceId {
        WorkflowInstanceId::generate()
    }
}

/// `{prefix}-{n}` ids from a counter starting at 1.
#[derive(Debug)]
pub struct SequentialAllocator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialAllocator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::starting_at(prefix, 1)
    }

    pub fn starting_at(prefix: impl Into<String>, first: u64) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(first),
        }
    }
}

impl IdentityAllocator for SequentialAllocator {
    fn allocate(&self) -> WorkflowInstanceId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        WorkflowInstanceId::new(format!("{}-{}", self.prefix, n))
    }
}
