//! Snapshot-based recovery: persisting execution state after each step and
//! resuming it, bounded by a retry policy, after a process restart.

mod memory;
mod middleware;
mod provider;
mod recovery;
mod snapshot;

pub use memory::InMemoryPersistenceProvider;
pub use middleware::PersistenceMiddleware;
pub use provider::{PersistenceProvider, RecoveryCatalog};
pub use recovery::{RecoveryCoordinator, RecoveryOutcome, RetryPolicy};
pub use snapshot::{foundry_key, workflow_key, Snapshot};
