//! Three disjoint event families covering workflow, operation, and
//! compensation lifecycles, each backed by a registered-callback list with
//! synchronous, in-order emission. Handlers that need concurrency are
//! expected to hand off to their own executor rather than block emission.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::OperationId;
use crate::value::Value;

/// Workflow lifecycle events, emitted by [`super::Smith`].
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    Started {
        workflow_id: uuid::Uuid,
        workflow_name: String,
        execution_id: uuid::Uuid,
    },
    Completed {
        execution_id: uuid::Uuid,
        duration: Duration,
    },
    Failed {
        execution_id: uuid::Uuid,
        error: String,
        failed_operation_name: Option<String>,
    },
}

/// Operation lifecycle events, emitted by [`super::Foundry`].
#[derive(Debug, Clone)]
pub enum OperationEvent {
    Started {
        operation_id: OperationId,
        operation_name: String,
        input: Value,
    },
    Completed {
        operation_id: OperationId,
        operation_name: String,
        input: Value,
        output: Value,
        duration: Duration,
    },
    Failed {
        operation_id: OperationId,
        operation_name: String,
        input: Value,
        error: String,
        duration: Duration,
    },
}

/// Compensation lifecycle events, emitted by [`super::Smith`].
#[derive(Debug, Clone)]
pub enum CompensationEvent {
    Triggered {
        reason: String,
        failed_operation_name: Option<String>,
        error: String,
    },
    OperationRestoreStarted {
        operation_id: OperationId,
        operation_name: String,
    },
    OperationRestoreCompleted {
        operation_id: OperationId,
        operation_name: String,
    },
    OperationRestoreFailed {
        operation_id: OperationId,
        operation_name: String,
        error: String,
    },
    Completed {
        successful_restores: usize,
        failed_restores: usize,
        duration: Duration,
    },
}

type Handler<E> = dyn Fn(&E) + Send + Sync;

/// An ordered, thread-safe list of subscribers for one event family.
///
/// Emission is synchronous and runs subscribers in registration order.
pub struct EventBus<E> {
    handlers: RwLock<Vec<Arc<Handler<E>>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Returns nothing handle-able for
    /// unsubscription: subscriptions live for the bus's lifetime, matching
    /// how the engine uses these (one set of subscribers per Foundry/Smith
    /// for the run's duration).
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Emit an event to every subscriber, in registration order.
    pub fn emit(&self, event: &E) {
        let handlers = self.handlers.read();
        for handler in handlers.iter() {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }
}
