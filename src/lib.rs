//! Embeddable, in-process workflow orchestration: ordered operations bound
//! to a shared execution context, wrapped in Russian-doll middleware, with
//! saga-style compensation on failure and optional snapshot-based recovery.

pub mod error;
pub mod logging;
pub mod options;
pub mod persistence;
pub mod service_provider;
pub mod value;
pub mod workflow;

// Testing utilities - available when the "testing" feature is enabled or in test mode
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{FailedCompensation, ForgeError, Result};
pub use logging::{Fields, LogLevel, Logger, NullLogger, TracingLogger};
pub use options::{ForgeOptions, ForgeOptionsBuilder, PersistenceOptions};
pub use persistence::{
    InMemoryPersistenceProvider, PersistenceMiddleware, PersistenceProvider, RecoveryCatalog,
    RecoveryCoordinator, RecoveryOutcome, RetryPolicy, Snapshot,
};
pub use service_provider::{ServiceProvider, ServiceProviderExt, ServiceRegistry};
pub use value::{from_value, to_value, Value};
pub use workflow::{
    ChildOutcome, CompensationEvent, ConditionalOperation, DataStrategy, EventBus, FnOperation,
    ForEachOperation, Foundry, FoundryBuilder, Middleware, Next, Operation, OperationEvent,
    OperationId, Smith, TypedOperation, Workflow, WorkflowBuilder, WorkflowEvent, WorkflowId,
};
