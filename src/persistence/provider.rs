//! Persistence capabilities: saving/loading/deleting snapshots, and
//! enumerating runs a recovery pass should attempt to resume.

use async_trait::async_trait;

use super::snapshot::Snapshot;
use crate::error::Result;

/// Saves, loads, and deletes [`Snapshot`]s for a foundry/workflow pairing.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    async fn try_load(&self, foundry_key: &str, workflow_key: &str) -> Result<Option<Snapshot>>;

    async fn delete(&self, foundry_key: &str, workflow_key: &str) -> Result<()>;
}

/// Enumerates snapshots left behind by runs that never reached a terminal
/// state — the input to a recovery pass after a process restart.
#[async_trait]
pub trait RecoveryCatalog: Send + Sync {
    async fn list_pending(&self) -> Result<Vec<Snapshot>>;
}
