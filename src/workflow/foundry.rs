//! Foundry: the per-run execution context bound to exactly one workflow.
//!
//! A `Foundry` is cheap to clone (an `Arc` around shared interior state) so
//! that fan-out operations such as [`super::ForEachOperation`] can hand a
//! cloned handle to each concurrently spawned child without threading
//! lifetimes through `tokio::spawn`. Its property map, middleware pipeline,
//! and bound workflow become read-only for the duration of a run: `freeze`
//! is called once by [`super::Smith`] immediately before executing the
//! first step, and any attempt to mutate the pipeline or rebind the
//! workflow after that point fails with [`ForgeError::PipelineFrozen`].

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{EventBus, OperationEvent};
use super::middleware::{invoke_chain, Middleware};
use super::operation::{Operation, OperationId};
use super::workflow::Workflow;
use crate::error::{ForgeError, Result};
use crate::logging::{Fields, LogLevel, Logger, TracingLogger};
use crate::service_provider::ServiceProvider;
use crate::value::Value;

/// Property keys the engine itself writes to and reads from. Hosts may read
/// these but should not overwrite them; doing so only corrupts the
/// engine's own bookkeeping, it isn't rejected at the API boundary.
pub mod reserved_keys {
    /// Index of the operation currently executing (advisory; for
    /// diagnostics and persistence, not used for control flow).
    pub const CURRENT_OPERATION_INDEX: &str = "current_operation_index";
    /// Monotonic counter of snapshot saves performed by a persistence
    /// middleware against this foundry.
    pub const PERSISTENCE_EXEC_COUNTER: &str = "persistence.exec_counter";
    /// Set to `true` once a run has been restored from a snapshot.
    pub const PERSISTENCE_RESTORED: &str = "persistence.restored";

    /// Key under which operation `index`'s output is recorded once it
    /// completes, so a later step (or a persisted snapshot) can look it up
    /// by position and name rather than just by chained input.
    pub fn operation_output_key(index: usize, name: &str) -> String {
        format!("operation_output[{index},{name}]")
    }

    /// Recover the index encoded in an `operation_output_key`, or `None` if
    /// `key` isn't one.
    pub fn parse_operation_output_index(key: &str) -> Option<usize> {
        let rest = key.strip_prefix("operation_output[")?;
        let (index, _) = rest.split_once(',')?;
        index.parse().ok()
    }
}

struct FoundryInner {
    execution_id: Uuid,
    name: String,
    properties: DashMap<String, Value>,
    current_workflow: RwLock<Option<Workflow>>,
    operation_sequence: RwLock<Vec<Arc<dyn Operation>>>,
    middleware_pipeline: RwLock<Vec<Arc<dyn Middleware>>>,
    is_frozen: AtomicBool,
    current_operation_index: AtomicI64,
    service_provider: Option<Arc<dyn ServiceProvider>>,
    logger: Arc<dyn Logger>,
    operation_events: EventBus<OperationEvent>,
    auto_dispose_operations: bool,
}

/// Per-run execution context: owns the concurrent property bag, the
/// middleware pipeline, and the bound workflow, and drives individual
/// operation invocations through that pipeline.
#[derive(Clone)]
pub struct Foundry {
    inner: Arc<FoundryInner>,
}

impl Foundry {
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> FoundryBuilder {
        FoundryBuilder::new(name)
    }

    pub fn execution_id(&self) -> Uuid {
        self.inner.execution_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.inner.logger
    }

    pub fn service_provider(&self) -> Option<&Arc<dyn ServiceProvider>> {
        self.inner.service_provider.as_ref()
    }

    /// Resolve a service of type `T` from the installed [`ServiceProvider`],
    /// if any is installed and it has one registered.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        use crate::service_provider::ServiceProviderExt;
        self.inner.service_provider.as_ref()?.resolve::<T>()
    }

    pub fn auto_dispose_operations(&self) -> bool {
        self.inner.auto_dispose_operations
    }

    // -- properties ---------------------------------------------------

    pub fn set_property(&self, key: impl Into<String>, value: Value) {
        self.inner.properties.insert(key.into(), value);
    }

    pub fn try_get_property(&self, key: &str) -> Option<Value> {
        self.inner.properties.get(key).map(|r| r.value().clone())
    }

    /// Fetch and deserialize a property, or `None` if the key is unset or
    /// does not deserialize as `T`.
    pub fn get_property<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.try_get_property(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn remove_property(&self, key: &str) -> Option<Value> {
        self.inner.properties.remove(key).map(|(_, v)| v)
    }

    pub fn property_keys(&self) -> Vec<String> {
        self.inner.properties.iter().map(|r| r.key().clone()).collect()
    }

    // -- workflow binding ----------------------------------------------

    pub fn current_workflow(&self) -> Option<Workflow> {
        self.inner.current_workflow.read().clone()
    }

    /// Bind a workflow definition to this foundry, seeding the foundry's own
    /// [`operation_sequence`](Self::operation_sequence) from it. Fails if
    /// the foundry is already frozen (a run is in progress).
    pub fn bind_workflow(&self, workflow: Workflow) -> Result<()> {
        self.ensure_unfrozen()?;
        *self.inner.operation_sequence.write() = workflow.operations().to_vec();
        *self.inner.current_workflow.write() = Some(workflow);
        Ok(())
    }

    // -- operation sequence ------------------------------------------------

    /// The operations this foundry will execute, seeded from the bound
    /// workflow by [`bind_workflow`](Self::bind_workflow) and mutable (while
    /// unfrozen) via [`add_operation`](Self::add_operation) and
    /// [`replace_operations`](Self::replace_operations). This is what
    /// `Smith` actually iterates when driving a run, so changes here take
    /// effect on the next (or, for `add_operation`, the remaining part of
    /// an as-yet-unfrozen) run.
    pub fn operation_sequence(&self) -> Vec<Arc<dyn Operation>> {
        self.inner.operation_sequence.read().clone()
    }

    /// Append one operation to the end of the sequence. Fails if the
    /// foundry is frozen (a run is in progress).
    pub fn add_operation(&self, operation: Arc<dyn Operation>) -> Result<()> {
        self.ensure_unfrozen()?;
        self.inner.operation_sequence.write().push(operation);
        Ok(())
    }

    /// Atomically replace the whole operation sequence, e.g. to rebind a
    /// foundry to another workflow's operations ahead of a fresh run. Fails
    /// if the foundry is frozen.
    pub fn replace_operations(&self, operations: Vec<Arc<dyn Operation>>) -> Result<()> {
        self.ensure_unfrozen()?;
        *self.inner.operation_sequence.write() = operations;
        Ok(())
    }

    // -- middleware pipeline ---------------------------------------------

    /// Append a middleware to the end of the pipeline (outermost-added-first:
    /// the first middleware ever added wraps everything else).
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) -> Result<()> {
        self.ensure_unfrozen()?;
        self.inner.middleware_pipeline.write().push(middleware);
        Ok(())
    }

    pub fn middleware_count(&self) -> usize {
        self.inner.middleware_pipeline.read().len()
    }

    fn middleware_snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.inner.middleware_pipeline.read().clone()
    }

    // -- freeze / run state ----------------------------------------------

    pub fn is_frozen(&self) -> bool {
        self.inner.is_frozen.load(Ordering::SeqCst)
    }

    pub(crate) fn freeze(&self) {
        self.inner.is_frozen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn unfreeze(&self) {
        self.inner.is_frozen.store(false, Ordering::SeqCst);
    }

    fn ensure_unfrozen(&self) -> Result<()> {
        if self.is_frozen() {
            Err(ForgeError::PipelineFrozen)
        } else {
            Ok(())
        }
    }

    pub fn current_operation_index(&self) -> i64 {
        self.inner.current_operation_index.load(Ordering::SeqCst)
    }

    // -- events -----------------------------------------------------------

    pub fn on_operation_event<F>(&self, handler: F)
    where
        F: Fn(&OperationEvent) + Send + Sync + 'static,
    {
        self.inner.operation_events.subscribe(handler);
    }

    fn emit_operation_event(&self, event: OperationEvent) {
        self.inner.operation_events.emit(&event);
    }

    // -- step execution ----------------------------------------------------

    /// Run one operation at pipeline position `index`, through the
    /// currently installed middleware chain. Records `current_operation_index`
    /// and, on success, the operation's output under a position-and-name
    /// keyed property so later steps or a persistence layer can look it up.
    ///
    /// If this run was restored from a snapshot and `index`'s output is
    /// already cached, the step is skipped entirely before any event fires
    /// or any middleware runs: the cached value is returned directly. A
    /// resumed run must not re-emit `OperationStarted`/`OperationCompleted`
    /// for steps it never actually re-executed.
    ///
    /// `timeout`, when set, bounds the middleware chain's execution; an
    /// elapsed timeout surfaces as [`ForgeError::Cancelled`].
    pub async fn run_step(
        &self,
        operation: &dyn Operation,
        index: usize,
        input: Value,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let restored = self
            .get_property::<bool>(reserved_keys::PERSISTENCE_RESTORED)
            .unwrap_or(false);
        if restored {
            let key = reserved_keys::operation_output_key(index, operation.name());
            if let Some(cached) = self.try_get_property(&key) {
                return Ok(cached);
            }
        }

        self.inner
            .current_operation_index
            .store(index as i64, Ordering::SeqCst);
        self.set_property(reserved_keys::CURRENT_OPERATION_INDEX, Value::from(index));

        self.emit_operation_event(OperationEvent::Started {
            operation_id: operation.id(),
            operation_name: operation.name().to_string(),
            input: input.clone(),
        });
        self.log_operation(
            LogLevel::Debug,
            operation.id(),
            operation.name(),
            "operation started",
        );

        let middlewares = self.middleware_snapshot();
        let started = Instant::now();
        let fut = invoke_chain(&middlewares, 0, operation, self, input.clone(), cancel);
        let result = match timeout {
            Some(d) => match tokio::time::timeout(d, fut).await {
                Ok(r) => r,
                Err(_) => Err(ForgeError::Cancelled),
            },
            None => fut.await,
        };
        let duration = started.elapsed();

        match &result {
            Ok(output) => {
                self.set_property(
                    reserved_keys::operation_output_key(index, operation.name()),
                    output.clone(),
                );
                self.emit_operation_event(OperationEvent::Completed {
                    operation_id: operation.id(),
                    operation_name: operation.name().to_string(),
                    input,
                    output: output.clone(),
                    duration,
                });
                self.log_operation(
                    LogLevel::Information,
                    operation.id(),
                    operation.name(),
                    "operation completed",
                );
            }
            Err(e) => {
                self.emit_operation_event(OperationEvent::Failed {
                    operation_id: operation.id(),
                    operation_name: operation.name().to_string(),
                    input,
                    error: e.to_string(),
                    duration,
                });
                self.log_operation(
                    LogLevel::Error,
                    operation.id(),
                    operation.name(),
                    &format!("operation failed: {e}"),
                );
            }
        }

        result
    }

    fn log_operation(&self, level: LogLevel, id: OperationId, name: &str, message: &str) {
        let mut fields = Fields::new();
        fields.insert("operation_id".into(), Value::from(id.to_string()));
        fields.insert("operation_name".into(), Value::from(name));
        fields.insert("execution_id".into(), Value::from(self.execution_id().to_string()));
        self.inner.logger.log(level, message, fields);
    }
}

/// Builds a [`Foundry`] with optional service provider, logger, and
/// disposal policy; unset fields fall back to sensible defaults (random
/// execution id, no service provider, `tracing`-backed logger, operations
/// disposed automatically).
pub struct FoundryBuilder {
    name: String,
    execution_id: Option<Uuid>,
    service_provider: Option<Arc<dyn ServiceProvider>>,
    logger: Option<Arc<dyn Logger>>,
    auto_dispose_operations: bool,
}

impl FoundryBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            execution_id: None,
            service_provider: None,
            logger: None,
            auto_dispose_operations: true,
        }
    }

    pub fn execution_id(mut self, id: Uuid) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn service_provider(mut self, provider: Arc<dyn ServiceProvider>) -> Self {
        self.service_provider = Some(provider);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn auto_dispose_operations(mut self, v: bool) -> Self {
        self.auto_dispose_operations = v;
        self
    }

    pub fn build(self) -> Foundry {
        Foundry {
            inner: Arc::new(FoundryInner {
                execution_id: self.execution_id.unwrap_or_else(Uuid::new_v4),
                name: self.name,
                properties: DashMap::new(),
                current_workflow: RwLock::new(None),
                operation_sequence: RwLock::new(Vec::new()),
                middleware_pipeline: RwLock::new(Vec::new()),
                is_frozen: AtomicBool::new(false),
                current_operation_index: AtomicI64::new(-1),
                service_provider: self.service_provider,
                logger: self.logger.unwrap_or_else(|| Arc::new(TracingLogger)),
                operation_events: EventBus::new(),
                auto_dispose_operations: self.auto_dispose_operations,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FnOperation;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn properties_round_trip_through_dashmap() {
        let foundry = Foundry::new("t");
        foundry.set_property("count", Value::from(3));
        assert_eq!(foundry.get_property::<i64>("count"), Some(3));
        assert_eq!(foundry.remove_property("count"), Some(Value::from(3)));
        assert_eq!(foundry.try_get_property("count"), None);
    }

    #[test]
    fn foundry_clones_share_state() {
        let foundry = Foundry::new("t");
        let clone = foundry.clone();
        clone.set_property("shared", Value::from(true));
        assert_eq!(foundry.get_property::<bool>("shared"), Some(true));
    }

    #[test]
    fn mutating_pipeline_after_freeze_fails() {
        let foundry = Foundry::new("t");
        foundry.freeze();
        let err = foundry
            .bind_workflow(crate::workflow::Workflow::builder("x").build())
            .unwrap_err();
        assert!(matches!(err, ForgeError::PipelineFrozen));
    }

    #[tokio::test]
    async fn run_step_records_output_property_and_emits_events() {
        let foundry = Foundry::new("t");
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let e = events.clone();
        foundry.on_operation_event(move |ev| e.lock().unwrap().push(format!("{ev:?}")));

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let op = FnOperation::new("double", move |i, _f, _c| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Value::from(i.as_i64().unwrap_or(0) * 2))
            }
        });

        let out = foundry
            .run_step(&op, 0, Value::from(10), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(out, Value::from(20));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            foundry.try_get_property(&reserved_keys::operation_output_key(0, "double")),
            Some(Value::from(20))
        );
        assert_eq!(foundry.current_operation_index(), 0);
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_step_skips_without_emitting_events_when_restored_output_is_cached() {
        let foundry = Foundry::new("t");
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let e = events.clone();
        foundry.on_operation_event(move |ev| e.lock().unwrap().push(format!("{ev:?}")));

        foundry.set_property(reserved_keys::PERSISTENCE_RESTORED, Value::from(true));
        foundry.set_property(
            reserved_keys::operation_output_key(0, "double"),
            Value::from(99),
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let op = FnOperation::new("double", move |i, _f, _c| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Value::from(i.as_i64().unwrap_or(0) * 2))
            }
        });

        let out = foundry
            .run_step(&op, 0, Value::from(10), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(out, Value::from(99));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "skipped step must not re-run forward");
        assert!(events.lock().unwrap().is_empty(), "skipped step must not emit operation events");
    }

    #[test]
    fn add_operation_appends_to_the_sequence_seeded_from_the_bound_workflow() {
        let foundry = Foundry::new("t");
        foundry
            .bind_workflow(
                crate::workflow::Workflow::builder("w")
                    .add_operation(Arc::new(FnOperation::new("a", |i, _f, _c| async move { Ok(i) })))
                    .build(),
            )
            .unwrap();
        assert_eq!(foundry.operation_sequence().len(), 1);

        foundry
            .add_operation(Arc::new(FnOperation::new("b", |i, _f, _c| async move { Ok(i) })))
            .unwrap();
        let names: Vec<_> = foundry
            .operation_sequence()
            .iter()
            .map(|op| op.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn replace_operations_swaps_the_whole_sequence() {
        let foundry = Foundry::new("t");
        foundry
            .add_operation(Arc::new(FnOperation::new("a", |i, _f, _c| async move { Ok(i) })))
            .unwrap();
        foundry
            .replace_operations(vec![Arc::new(FnOperation::new("b", |i, _f, _c| async move { Ok(i) }))])
            .unwrap();
        let names: Vec<_> = foundry
            .operation_sequence()
            .iter()
            .map(|op| op.name().to_string())
            .collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn mutating_operation_sequence_after_freeze_fails() {
        let foundry = Foundry::new("t");
        foundry.freeze();
        let err = foundry
            .add_operation(Arc::new(FnOperation::new("a", |i, _f, _c| async move { Ok(i) })))
            .unwrap_err();
        assert!(matches!(err, ForgeError::PipelineFrozen));
        let err = foundry.replace_operations(vec![]).unwrap_err();
        assert!(matches!(err, ForgeError::PipelineFrozen));
    }
}
