//! An in-process [`PersistenceProvider`] backed by a concurrent map.
//! Useful for tests and for hosts that only need recovery across a single
//! process's own restarts-within-a-debugger, not a real one.

use async_trait::async_trait;
use dashmap::DashMap;

use super::provider::{PersistenceProvider, RecoveryCatalog};
use super::snapshot::Snapshot;
use crate::error::Result;

#[derive(Default)]
pub struct InMemoryPersistenceProvider {
    snapshots: DashMap<(String, String), Snapshot>,
}

impl InMemoryPersistenceProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceProvider for InMemoryPersistenceProvider {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots.insert(
            (snapshot.foundry_key.clone(), snapshot.workflow_key.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn try_load(&self, foundry_key: &str, workflow_key: &str) -> Result<Option<Snapshot>> {
        Ok(self
            .snapshots
            .get(&(foundry_key.to_string(), workflow_key.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn delete(&self, foundry_key: &str, workflow_key: &str) -> Result<()> {
        self.snapshots
            .remove(&(foundry_key.to_string(), workflow_key.to_string()));
        Ok(())
    }
}

#[async_trait]
impl RecoveryCatalog for InMemoryPersistenceProvider {
    async fn list_pending(&self) -> Result<Vec<Snapshot>> {
        Ok(self.snapshots.iter().map(|r| r.value().clone()).collect())
    }
}
