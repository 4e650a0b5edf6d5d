//! Workflow: an immutable, named, ordered sequence of operations.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::operation::{DataStrategy, ForEachOperation};
use super::Operation;

/// Unique identifier for a [`Workflow`] definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable, ordered list of operations with identity and metadata.
///
/// Built via [`WorkflowBuilder`]; once `build()` returns, `operations` can
/// never be observed as mutated — its identity is stable for the lifetime
/// of any executing [`super::Foundry`] bound to it.
#[derive(Clone)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    operations: Arc<Vec<Arc<dyn Operation>>>,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn operations(&self) -> &[Arc<dyn Operation>] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Convenience constructor: a workflow made of one for-each operation
    /// running `ops` sequentially (concurrency = 1, shared input) in the
    /// order given.
    pub fn sequential(name: impl Into<String>, ops: Vec<Arc<dyn Operation>>) -> Self {
        let fan_out = ForEachOperation::new("sequential", ops)
            .with_concurrency(1)
            .with_strategy(DataStrategy::Shared);
        Self::builder(name)
            .add_operation(Arc::new(fan_out))
            .build()
    }

    /// Convenience constructor: a workflow made of one for-each operation
    /// running `ops` concurrently with shared input and unbounded
    /// concurrency.
    pub fn parallel(name: impl Into<String>, ops: Vec<Arc<dyn Operation>>) -> Self {
        let fan_out = ForEachOperation::new("parallel", ops).with_strategy(DataStrategy::Shared);
        Self::builder(name)
            .add_operation(Arc::new(fan_out))
            .build()
    }
}

/// Collects metadata and appends operations in order; `build()` freezes
/// the result into an immutable [`Workflow`].
pub struct WorkflowBuilder {
    id: WorkflowId,
    name: String,
    version: Option<String>,
    description: Option<String>,
    operations: Vec<Arc<dyn Operation>>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            version: None,
            description: None,
            operations: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: WorkflowId) -> Self {
        self.id = id;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append an operation. Building with an empty operation sequence is
    /// permitted — executing it is a no-op that still fires
    /// `WorkflowStarted`/`WorkflowCompleted`.
    pub fn add_operation(mut self, operation: Arc<dyn Operation>) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn build(self) -> Workflow {
        Workflow {
            id: self.id,
            name: self.name,
            version: self.version,
            description: self.description,
            operations: Arc::new(self.operations),
        }
    }
}
