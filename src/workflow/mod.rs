//! The orchestration engine: workflows, operations, the execution context
//! that binds them, middleware composition, and the orchestrator that
//! drives a run end to end.

mod events;
mod foundry;
mod middleware;
mod operation;
mod smith;
mod workflow;

pub use events::{CompensationEvent, EventBus, OperationEvent, WorkflowEvent};
pub use foundry::{reserved_keys, Foundry, FoundryBuilder};
pub use middleware::{Middleware, Next};
pub use operation::{
    ChildOutcome, ConditionalOperation, DataStrategy, FnOperation, ForEachOperation, Operation,
    OperationId, TypedOperation,
};
pub use smith::Smith;
pub use workflow::{Workflow, WorkflowBuilder, WorkflowId};
