//! Workflow definition references
//!
//! Definitions are authored and registered outside this crate. Instances
//! only carry the definition's id, which nothing here interprets.

use serde::{Deserialize, Serialize};

/// Identifier of the workflow definition an instance executes
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct WorkflowDefinitionId(pub String);

impl WorkflowDefinitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowDefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkflowDefinitionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
