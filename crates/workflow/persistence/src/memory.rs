//! In-memory reference implementation of [`PersistenceProvider`].
//!
//! Deterministic and test-friendly. State lives only as long as the provider;
//! clones share the same underlying store.

use crate::concurrency::ConcurrencyController;
use crate::config::{IdentityStrategy, PersistenceConfig};
use crate::identity::{IdentityAllocator, SequentialAllocator, UuidAllocator};
use crate::query::{by_create_time, by_next_execution, InstanceFilter};
use crate::traits::PersistenceProvider;
use crate::{PersistenceError, PersistenceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use workflow_types::{WorkflowInstance, WorkflowInstanceId, INITIAL_VERSION};

/// In-memory workflow instance store.
#[derive(Clone)]
pub struct InMemoryPersistenceProvider {
    controller: Arc<ConcurrencyController>,
    allocator: Arc<dyn IdentityAllocator>,
}

impl InMemoryPersistenceProvider {
    /// An empty store with UUID ids and the default lock timeout.
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(UuidAllocator))
    }

    pub fn with_allocator(allocator: Arc<dyn IdentityAllocator>) -> Self {
        let timeout = PersistenceConfig::default().concurrency.lock_timeout();
        Self {
            controller: Arc::new(ConcurrencyController::new(timeout)),
            allocator,
        }
    }

    /// Longest wait for one instance's lock, fixed at construction.
    pub fn lock_timeout(&self) -> Duration {
        self.controller.lock_timeout()
    }

    /// Build a store from validated configuration.
    pub fn from_config(config: &PersistenceConfig) -> PersistenceResult<Self> {
        config.validate()?;

        let allocator: Arc<dyn IdentityAllocator> = match config.identity.strategy {
            IdentityStrategy::Uuid => Arc::new(UuidAllocator),
            IdentityStrategy::Sequential => {
                Arc::new(SequentialAllocator::new(config.identity.prefix.clone()))
            }
        };

        let timeout = config.concurrency.lock_timeout();
        let controller = if config.memory.shard_amount == 0 {
            ConcurrencyController::with_capacity(config.memory.initial_capacity, timeout)
        } else {
            ConcurrencyController::with_capacity_and_shard_amount(
                config.memory.initial_capacity,
                config.memory.shard_amount,
                timeout,
            )
        };

        Ok(Self {
            controller: Arc::new(controller),
            allocator,
        })
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        self.controller.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controller.is_empty()
    }
}

impl Default for InMemoryPersistenceProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryPersistenceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPersistenceProvider")
            .field("instances", &self.controller.len())
            .field("lock_timeout", &self.controller.lock_timeout())
            .finish()
    }
}

/// Construct the reference provider described by `config`.
pub fn build_provider(config: &PersistenceConfig) -> PersistenceResult<InMemoryPersistenceProvider> {
    InMemoryPersistenceProvider::from_config(config)
}

#[async_trait]
impl PersistenceProvider for InMemoryPersistenceProvider {
    #[tracing::instrument(skip(self, instance), fields(definition = %instance.workflow_definition_id))]
    async fn create_new_workflow(
        &self,
        instance: &mut WorkflowInstance,
    ) -> PersistenceResult<WorkflowInstanceId> {
        let id = if instance.id.is_unassigned() {
            self.allocator.allocate()
        } else {
            instance.id.clone()
        };

        let mut record = instance.clone();
        record.id = id.clone();
        record.version = INITIAL_VERSION;

        if let Err(err) = self.controller.insert_new(record) {
            tracing::warn!(instance_id = %id, error = %err, "create rejected");
            return Err(err);
        }

        instance.id = id.clone();
        instance.version = INITIAL_VERSION;
        tracing::debug!(instance_id = %id, version = INITIAL_VERSION, "created workflow instance");
        Ok(id)
    }

    #[tracing::instrument(skip(self, id), fields(instance_id = %id))]
    async fn get_workflow_instance(
        &self,
        id: &WorkflowInstanceId,
    ) -> PersistenceResult<WorkflowInstance> {
        self.controller.read(id)
    }

    #[tracing::instrument(skip(self, instance), fields(instance_id = %instance.id, version = instance.version))]
    async fn persist_workflow(&self, instance: &mut WorkflowInstance) -> PersistenceResult<()> {
        if instance.id.is_unassigned() {
            return Err(PersistenceError::NotFound(instance.id.clone()));
        }

        let version = self.controller.compare_and_swap(instance)?;
        instance.version = version;
        tracing::debug!(instance_id = %instance.id, version, "persisted workflow instance");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_runnable_instances(
        &self,
        as_of: DateTime<Utc>,
    ) -> PersistenceResult<Vec<WorkflowInstance>> {
        let mut runnable = self.controller.snapshot_where(|i| i.is_due(as_of))?;
        runnable.sort_by(by_next_execution);
        tracing::debug!(count = runnable.len(), "collected runnable instances");
        Ok(runnable)
    }

    #[tracing::instrument(skip(self, ids), fields(requested = ids.len()))]
    async fn get_workflow_instances(
        &self,
        ids: &[WorkflowInstanceId],
    ) -> PersistenceResult<Vec<WorkflowInstance>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.controller.read(id) {
                Ok(instance) => found.push(instance),
                Err(PersistenceError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(found)
    }

    #[tracing::instrument(skip(self, filter))]
    async fn query_workflow_instances(
        &self,
        filter: &InstanceFilter,
    ) -> PersistenceResult<Vec<WorkflowInstance>> {
        filter.validate().map_err(PersistenceError::InvalidInput)?;

        let mut matched = self.controller.snapshot_where(|i| filter.matches(i))?;
        matched.sort_by(by_create_time);
        Ok(filter.window.apply(matched))
    }
}
