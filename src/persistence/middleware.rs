//! Checkpoint-after-each-step persistence, wired in as ordinary middleware.
//!
//! Skip-if-already-completed is handled upstream, in
//! [`crate::workflow::Foundry::run_step`], before this middleware (or any
//! other) ever runs — that's what keeps a resumed run from re-emitting
//! operation events for steps it didn't actually re-execute.
//! [`PersistenceMiddleware`] itself only does the save side: checkpointing
//! after a step succeeds (gated by `persist_on_operation_complete`),
//! checkpointing at the point of failure (gated by `persist_on_failure`),
//! and deleting the snapshot once every operation has completed (gated by
//! `persist_on_workflow_complete`) — a finished run has nothing left to
//! resume into, and a stale snapshot would otherwise look resumable.
//! Restoring a prior snapshot into a foundry happens outside the middleware
//! chain via `restore`, since it must run while the foundry is still
//! unfrozen, ahead of `Smith::forge`. Deleting a snapshot after a
//! compensated (failed-and-unwound) run is likewise handled outside this
//! chain, by `Smith` calling `delete` once compensation completes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::provider::PersistenceProvider;
use super::snapshot::{self, Snapshot};
use crate::error::Result;
use crate::options::PersistenceOptions;
use crate::value::Value;
use crate::workflow::{reserved_keys, Foundry, Middleware, Next, Operation, WorkflowId};

pub struct PersistenceMiddleware {
    provider: Arc<dyn PersistenceProvider>,
    options: PersistenceOptions,
}

impl PersistenceMiddleware {
    /// Build a `PersistenceMiddleware`, validating `options` up front.
    pub fn new(provider: Arc<dyn PersistenceProvider>, options: PersistenceOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { provider, options })
    }

    fn keys(&self, foundry: &Foundry, workflow_id: WorkflowId) -> (String, String) {
        (
            snapshot::foundry_key(self.options.instance_id.as_deref(), foundry.execution_id()),
            snapshot::workflow_key(self.options.workflow_key.as_deref(), workflow_id),
        )
    }

    /// Load a prior snapshot (if any) into `foundry`'s properties. Must run
    /// before [`crate::workflow::Smith::forge`], while the foundry is still
    /// unfrozen. Returns whether a snapshot was found.
    pub async fn restore(&self, foundry: &Foundry, workflow_id: WorkflowId) -> Result<bool> {
        let (foundry_key, workflow_key) = self.keys(foundry, workflow_id);
        match self.provider.try_load(&foundry_key, &workflow_key).await? {
            Some(snap) => {
                for (k, v) in snap.properties {
                    foundry.set_property(k, v);
                }
                foundry.set_property(reserved_keys::PERSISTENCE_RESTORED, Value::from(true));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete any snapshot for this run. Intended to be called once a saga
    /// has fully compensated: past that point there is nothing left to
    /// resume into, and a stale snapshot would otherwise look resumable.
    pub async fn delete(&self, foundry: &Foundry, workflow_id: WorkflowId) -> Result<()> {
        let (foundry_key, workflow_key) = self.keys(foundry, workflow_id);
        self.provider.delete(&foundry_key, &workflow_key).await
    }

    /// Save the current property bag as a snapshot. When every operation in
    /// the bound workflow has now recorded an output (tracked via
    /// `completed_operation_indices`), and `persist_on_workflow_complete` is
    /// set, the snapshot is immediately deleted again instead: a run that
    /// has reached its last step has nothing left to resume into.
    async fn checkpoint(&self, foundry: &Foundry, workflow_id: WorkflowId) -> Result<()> {
        let (foundry_key, workflow_key) = self.keys(foundry, workflow_id);
        let version = foundry
            .get_property::<u32>(reserved_keys::PERSISTENCE_EXEC_COUNTER)
            .unwrap_or(0)
            + 1;
        foundry.set_property(reserved_keys::PERSISTENCE_EXEC_COUNTER, Value::from(version));

        let properties: HashMap<String, Value> = foundry
            .property_keys()
            .into_iter()
            .filter_map(|k| foundry.try_get_property(&k).map(|v| (k, v)))
            .collect();
        let completed_operation_indices: Vec<usize> = properties
            .keys()
            .filter_map(|k| reserved_keys::parse_operation_output_index(k))
            .collect();

        let next_operation_index = completed_operation_indices
            .iter()
            .copied()
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);
        let total_operations = foundry
            .current_workflow()
            .map(|w| w.operations().len())
            .unwrap_or(0);

        let snap = Snapshot {
            foundry_key: foundry_key.clone(),
            workflow_key: workflow_key.clone(),
            execution_id: foundry.execution_id(),
            properties,
            completed_operation_indices,
            version,
        };
        self.provider.save(&snap).await?;

        if self.options.persist_on_workflow_complete
            && total_operations > 0
            && next_operation_index >= total_operations
        {
            self.provider.delete(&foundry_key, &workflow_key).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Middleware for PersistenceMiddleware {
    async fn execute(
        &self,
        _operation: &dyn Operation,
        foundry: &Foundry,
        input: Value,
        next: Next<'_>,
        _cancel: &CancellationToken,
    ) -> Result<Value> {
        match next.call(input).await {
            Ok(output) => {
                let workflow_id = foundry.current_workflow().map(|w| w.id).unwrap_or_default();
                if self.options.persist_on_operation_complete {
                    self.checkpoint(foundry, workflow_id).await?;
                }
                Ok(output)
            }
            Err(e) => {
                if self.options.persist_on_failure {
                    let workflow_id = foundry.current_workflow().map(|w| w.id).unwrap_or_default();
                    // Best-effort: a persistence failure here must not mask
                    // the operation failure that triggered it.
                    let _ = self.checkpoint(foundry, workflow_id).await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistenceProvider;
    use crate::workflow::{FnOperation, Smith, Workflow};
    use crate::options::ForgeOptions;

    #[tokio::test]
    async fn restores_and_skips_completed_operations_on_resume() {
        let provider = Arc::new(InMemoryPersistenceProvider::new());
        let options = PersistenceOptions::default();
        let persistence = PersistenceMiddleware::new(provider.clone(), options).unwrap();

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        let workflow = Workflow::builder("resumable")
            .add_operation(Arc::new(FnOperation::new("step_a", move |i, _f, _c| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(i)
                }
            })))
            .build();

        let foundry = Foundry::new("t1");
        foundry.add_middleware(Arc::new(PersistenceMiddleware::new(
            provider.clone(),
            PersistenceOptions::default(),
        ).unwrap())).unwrap();
        let smith = Smith::new(ForgeOptions::default()).unwrap();
        smith
            .forge(workflow.clone(), &foundry, Value::from(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Simulate a fresh process: new foundry, restore prior state, rerun.
        let resumed_foundry = Foundry::new("t1");
        let found = persistence
            .restore(&resumed_foundry, workflow.id)
            .await
            .unwrap();
        assert!(found);
        resumed_foundry
            .add_middleware(Arc::new(PersistenceMiddleware::new(
                provider.clone(),
                PersistenceOptions::default(),
            ).unwrap()))
            .unwrap();

        smith
            .forge(workflow, &resumed_foundry, Value::from(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            calls.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "resumed run must skip the already-completed step"
        );
    }

    #[tokio::test]
    async fn snapshot_is_deleted_once_the_whole_workflow_completes() {
        use crate::persistence::PersistenceProvider;

        let provider = Arc::new(InMemoryPersistenceProvider::new());
        let workflow = Workflow::builder("billing")
            .add_operation(Arc::new(FnOperation::new("charge_card", |i, _f, _c| async move { Ok(i) })))
            .build();

        let foundry = Foundry::new("billing-instance");
        foundry
            .add_middleware(Arc::new(
                PersistenceMiddleware::new(provider.clone(), PersistenceOptions::default()).unwrap(),
            ))
            .unwrap();
        let smith = Smith::new(ForgeOptions::default()).unwrap();
        smith
            .forge(workflow.clone(), &foundry, Value::from(1), &CancellationToken::new())
            .await
            .unwrap();

        let (foundry_key, workflow_key) = (
            crate::persistence::foundry_key(None, foundry.execution_id()),
            crate::persistence::workflow_key(None, workflow.id),
        );
        assert!(
            provider.try_load(&foundry_key, &workflow_key).await.unwrap().is_none(),
            "a fully completed run must not leave a resumable snapshot behind"
        );
    }

    #[tokio::test]
    async fn persist_on_failure_checkpoints_before_propagating_the_error() {
        let provider = Arc::new(InMemoryPersistenceProvider::new());
        let options = PersistenceOptions {
            persist_on_failure: true,
            ..PersistenceOptions::default()
        };
        let foundry = Foundry::new("checkout");
        foundry
            .add_middleware(Arc::new(PersistenceMiddleware::new(provider.clone(), options).unwrap()))
            .unwrap();

        let workflow = Workflow::builder("checkout")
            .add_operation(Arc::new(FnOperation::new("reserve", |i, _f, _c| async move { Ok(i) })))
            .add_operation(Arc::new(FnOperation::new("charge", |_i, _f, _c| async move {
                Err(crate::error::ForgeError::NotFound("card declined".into()))
            })))
            .build();

        let smith = Smith::new(ForgeOptions::default()).unwrap();
        let err = smith
            .forge(workflow.clone(), &foundry, Value::from(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ForgeError::OperationFailure { .. }));

        let (foundry_key, workflow_key) = (
            crate::persistence::foundry_key(None, foundry.execution_id()),
            crate::persistence::workflow_key(None, workflow.id),
        );
        use crate::persistence::PersistenceProvider;
        let snap = provider
            .try_load(&foundry_key, &workflow_key)
            .await
            .unwrap()
            .expect("a failed step with persist_on_failure must still leave a snapshot");
        assert_eq!(snap.completed_operation_indices, vec![0]);
    }
}
