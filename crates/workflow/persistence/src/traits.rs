use crate::query::InstanceFilter;
use crate::PersistenceResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use workflow_types::{WorkflowInstance, WorkflowInstanceId};

/// Storage contract for workflow instances.
///
/// Every write goes through an optimistic compare-and-swap on the instance
/// version. Implementations never retry a failed write on the caller's
/// behalf, and every read returns an independent copy of committed state.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    /// Store a new instance and return its id.
    ///
    /// An unassigned id is allocated by the store; a caller-supplied id is
    /// kept and must not exist yet. On success the caller's instance carries
    /// the id and the initial version.
    ///
    /// # Errors
    ///
    /// `DuplicateId` if the id is already stored.
    async fn create_new_workflow(
        &self,
        instance: &mut WorkflowInstance,
    ) -> PersistenceResult<WorkflowInstanceId>;

    /// Read one instance.
    ///
    /// # Errors
    ///
    /// `NotFound` if no instance has this id.
    async fn get_workflow_instance(
        &self,
        id: &WorkflowInstanceId,
    ) -> PersistenceResult<WorkflowInstance>;

    /// Replace a stored instance if `instance.version` still matches.
    ///
    /// On success the stored version is one higher and the caller's instance
    /// carries it. On failure nothing changes on either side.
    ///
    /// # Errors
    ///
    /// `ConcurrencyConflict` if the stored version moved on, `NotFound` if
    /// the id does not exist.
    async fn persist_workflow(&self, instance: &mut WorkflowInstance) -> PersistenceResult<()>;

    /// Runnable instances whose `next_execution` is at or before `as_of`,
    /// earliest first.
    async fn get_runnable_instances(
        &self,
        as_of: DateTime<Utc>,
    ) -> PersistenceResult<Vec<WorkflowInstance>>;

    /// Batch read in the order requested. Unknown ids are skipped.
    async fn get_workflow_instances(
        &self,
        ids: &[WorkflowInstanceId],
    ) -> PersistenceResult<Vec<WorkflowInstance>>;

    /// Filtered listing ordered by creation time.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the filter's creation range is inverted.
    async fn query_workflow_instances(
        &self,
        filter: &InstanceFilter,
    ) -> PersistenceResult<Vec<WorkflowInstance>>;

    /// Like [`get_runnable_instances`](Self::get_runnable_instances), keeping
    /// at most `limit` instances (zero keeps all).
    async fn get_runnable_instances_limited(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> PersistenceResult<Vec<WorkflowInstance>> {
        let mut runnable = self.get_runnable_instances(as_of).await?;
        if limit > 0 {
            runnable.truncate(limit);
        }
        Ok(runnable)
    }
}
