//! Workflow instance model
//!
//! The types the engine hands to and receives from the persistence layer:
//!
//! - [`WorkflowInstance`] - one running occurrence of a workflow definition
//! - [`ExecutionPointerSet`] - the step-progress markers an instance owns
//! - [`WorkflowStatus`] / [`PointerStatus`] - lifecycle enums
//!
//! Every type is a plain value: `Clone` is a deep copy and `PartialEq` is
//! deep equality, which is what the persistence contract relies on for
//! copy-on-read snapshots.
//!
//! # Example
//!
//! ```rust
//! use workflow_types::*;
//!
//! let mut instance = WorkflowInstance::new(WorkflowDefinitionId::new("order-fulfilment"))
//!     .with_data(serde_json::json!({ "order": 42 }));
//! let pointer = instance
//!     .execution_pointers
//!     .add(ExecutionPointer::active(0))
//!     .unwrap();
//!
//! assert_eq!(instance.execution_pointers.active().count(), 1);
//! instance
//!     .execution_pointers
//!     .deactivate(&pointer, PointerStatus::Complete)
//!     .unwrap();
//! instance.complete();
//! assert!(instance.is_retired());
//! ```

#![deny(unsafe_code)]

mod definition;
mod error;
mod instance;
mod pointer;

pub use definition::WorkflowDefinitionId;
pub use error::{WorkflowError, WorkflowResult};
pub use instance::{WorkflowInstance, WorkflowInstanceId, WorkflowStatus, INITIAL_VERSION};
pub use pointer::{ExecutionPointer, ExecutionPointerId, ExecutionPointerSet, PointerStatus};
