//! Durable state store for workflow instances.
//!
//! This crate defines the storage contract the workflow engine runs against:
//! - create instances and receive a store-assigned identity
//! - read committed copies of an instance
//! - persist whole instances under optimistic concurrency
//! - list instances that are due for evaluation
//!
//! Every write is a compare-and-swap on the instance version. A writer that
//! lost a race gets `ConcurrencyConflict` and must re-read before trying
//! again; the store never retries or merges on its behalf.
//!
//! ```
//! use workflow_persistence::{InMemoryPersistenceProvider, PersistenceProvider};
//! use workflow_types::{WorkflowDefinitionId, WorkflowInstance};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), workflow_persistence::PersistenceError> {
//! let store = InMemoryPersistenceProvider::new();
//!
//! let mut instance = WorkflowInstance::new(WorkflowDefinitionId::new("orders"));
//! let id = store.create_new_workflow(&mut instance).await?;
//!
//! let mut copy = store.get_workflow_instance(&id).await?;
//! copy.suspend();
//! store.persist_workflow(&mut copy).await?;
//!
//! // `instance` still carries version 1 and is now stale.
//! assert!(store.persist_workflow(&mut instance).await.is_err());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod concurrency;
pub mod config;
mod error;
pub mod identity;
pub mod memory;
mod query;
pub mod telemetry;
mod traits;

pub use concurrency::{check_and_advance, ConcurrencyController};
pub use config::{
    ConcurrencyConfig, IdentityConfig, IdentityStrategy, LoggingConfig, MemoryConfig,
    PersistenceConfig,
};
pub use error::{PersistenceError, PersistenceResult};
pub use identity::{IdentityAllocator, SequentialAllocator, UuidAllocator};
pub use memory::{build_provider, InMemoryPersistenceProvider};
pub use query::{InstanceFilter, QueryWindow};
pub use telemetry::init_tracing;
pub use traits::PersistenceProvider;
