//! Operation: a unit of work with forward and compensation behaviour.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ForgeError, Result};
use crate::value::{self, Value};
use crate::workflow::Foundry;

/// Unique identifier for an [`Operation`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work exposing forward and (optionally) compensate behaviour.
///
/// Implementations are boxed as `Arc<dyn Operation>` once added to a
/// [`crate::workflow::Workflow`] or [`Foundry`], so `forward`/`compensate`
/// transport the opaque [`Value`] type rather than generic `Input`/`Output`
/// — typed callers reach for [`TypedOperation`], which serializes at its
/// own edges instead.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Stable identity for this operation instance.
    fn id(&self) -> OperationId;

    /// Human-readable name, used in events and error messages.
    fn name(&self) -> &str;

    /// Whether this operation declares non-trivial compensation. The Smith
    /// only pushes operations with `supports_restore() == true` onto the
    /// compensation stack, even after they succeed.
    fn supports_restore(&self) -> bool {
        false
    }

    /// Run the operation's forward behaviour.
    async fn forward(
        &self,
        input: Value,
        foundry: &Foundry,
        cancel: &CancellationToken,
    ) -> Result<Value>;

    /// Undo this operation's effects. Defaults to a no-op; operations that
    /// override `supports_restore` to `true` should also override this.
    async fn compensate(
        &self,
        _output: Value,
        _foundry: &Foundry,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    /// Release any resources owned by this operation. Called at Foundry
    /// disposal when `auto_dispose_operations` is set.
    async fn dispose(&self) {}
}

type ForwardFn = Arc<
    dyn Fn(Value, &Foundry, &CancellationToken) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>>
        + Send
        + Sync,
>;
type CompensateFn = Arc<
    dyn Fn(Value, &Foundry, &CancellationToken) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>
        + Send
        + Sync,
>;

/// An inline delegate operation backed by plain closures. Most workflows
/// are built from these rather than hand-written trait impls.
#[derive(Clone)]
pub struct FnOperation {
    id: OperationId,
    name: String,
    forward_fn: ForwardFn,
    compensate_fn: Option<CompensateFn>,
}

impl FnOperation {
    /// Build an operation from an async forward closure with no compensation.
    pub fn new<F, Fut>(name: impl Into<String>, forward: F) -> Self
    where
        F: Fn(Value, &Foundry, &CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            id: OperationId::new(),
            name: name.into(),
            forward_fn: Arc::new(move |input, foundry, cancel| Box::pin(forward(input, foundry, cancel))),
            compensate_fn: None,
        }
    }

    /// Attach a compensation closure. Presence of a compensation closure is
    /// what makes `supports_restore()` return `true`.
    pub fn with_compensate<C, Fut>(mut self, compensate: C) -> Self
    where
        C: Fn(Value, &Foundry, &CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensate_fn = Some(Arc::new(move |output, foundry, cancel| {
            Box::pin(compensate(output, foundry, cancel))
        }));
        self
    }
}

#[async_trait]
impl Operation for FnOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_restore(&self) -> bool {
        self.compensate_fn.is_some()
    }

    async fn forward(&self, input: Value, foundry: &Foundry, cancel: &CancellationToken) -> Result<Value> {
        (self.forward_fn)(input, foundry, cancel).await
    }

    async fn compensate(&self, output: Value, foundry: &Foundry, cancel: &CancellationToken) -> Result<()> {
        if let Some(f) = &self.compensate_fn {
            f(output, foundry, cancel).await
        } else {
            Ok(())
        }
    }
}

type TypedForwardFn<I, O> = Arc<
    dyn Fn(I, &Foundry, &CancellationToken) -> Pin<Box<dyn Future<Output = Result<O>> + Send + '_>>
        + Send
        + Sync,
>;
type TypedCompensateFn<O> = Arc<
    dyn Fn(O, &Foundry, &CancellationToken) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>
        + Send
        + Sync,
>;

/// A typed convenience wrapper over the untyped [`Operation`] trait:
/// `forward` deserializes its `Value` input into `I` before calling the
/// wrapped closure, and serializes the closure's `O` back into `Value` on
/// the way out (and the reverse for `compensate`). Host code working with
/// concrete Rust types reaches for this instead of hand-rolling the
/// serialize/deserialize dance around [`FnOperation`].
#[derive(Clone)]
pub struct TypedOperation<I, O> {
    id: OperationId,
    name: String,
    forward_fn: TypedForwardFn<I, O>,
    compensate_fn: Option<TypedCompensateFn<O>>,
}

impl<I, O> TypedOperation<I, O>
where
    I: DeserializeOwned + Send + Sync + 'static,
    O: Serialize + Send + Sync + 'static,
{
    /// Build a typed operation from an async forward closure with no
    /// compensation.
    pub fn new<F, Fut>(name: impl Into<String>, forward: F) -> Self
    where
        F: Fn(I, &Foundry, &CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Self {
            id: OperationId::new(),
            name: name.into(),
            forward_fn: Arc::new(move |input, foundry, cancel| Box::pin(forward(input, foundry, cancel))),
            compensate_fn: None,
        }
    }

    /// Attach a typed compensation closure. Presence of one is what makes
    /// `supports_restore()` return `true`.
    pub fn with_compensate<C, Fut>(mut self, compensate: C) -> Self
    where
        C: Fn(O, &Foundry, &CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensate_fn = Some(Arc::new(move |output, foundry, cancel| {
            Box::pin(compensate(output, foundry, cancel))
        }));
        self
    }
}

#[async_trait]
impl<I, O> Operation for TypedOperation<I, O>
where
    I: DeserializeOwned + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn id(&self) -> OperationId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_restore(&self) -> bool {
        self.compensate_fn.is_some()
    }

    async fn forward(&self, input: Value, foundry: &Foundry, cancel: &CancellationToken) -> Result<Value> {
        let typed_input: I = value::from_value(input)?;
        let output = (self.forward_fn)(typed_input, foundry, cancel).await?;
        value::to_value(&output)
    }

    async fn compensate(&self, output: Value, foundry: &Foundry, cancel: &CancellationToken) -> Result<()> {
        if let Some(f) = &self.compensate_fn {
            let typed_output: O = value::from_value(output)?;
            f(typed_output, foundry, cancel).await
        } else {
            Ok(())
        }
    }
}

type Predicate = Arc<dyn Fn(&Value, &Foundry) -> bool + Send + Sync>;

/// Selects exactly one of two child operations by evaluating a predicate
/// against `(input, foundry)`.
pub struct ConditionalOperation {
    id: OperationId,
    name: String,
    predicate: Predicate,
    true_branch: Arc<dyn Operation>,
    false_branch: Option<Arc<dyn Operation>>,
    /// Which branch ran forward, recorded so `compensate` only undoes that
    /// branch.
    ran_true: parking_lot::Mutex<Option<bool>>,
}

impl ConditionalOperation {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&Value, &Foundry) -> bool + Send + Sync + 'static,
        true_branch: Arc<dyn Operation>,
        false_branch: Option<Arc<dyn Operation>>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            name: name.into(),
            predicate: Arc::new(predicate),
            true_branch,
            false_branch,
            ran_true: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Operation for ConditionalOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_restore(&self) -> bool {
        self.true_branch.supports_restore()
            || self.false_branch.as_ref().is_some_and(|b| b.supports_restore())
    }

    async fn forward(&self, input: Value, foundry: &Foundry, cancel: &CancellationToken) -> Result<Value> {
        let take_true = (self.predicate)(&input, foundry);
        *self.ran_true.lock() = Some(take_true);

        if take_true {
            self.true_branch.forward(input, foundry, cancel).await
        } else if let Some(branch) = &self.false_branch {
            branch.forward(input, foundry, cancel).await
        } else {
            // No false branch and predicate false: pass input through.
            Ok(input)
        }
    }

    async fn compensate(&self, output: Value, foundry: &Foundry, cancel: &CancellationToken) -> Result<()> {
        match *self.ran_true.lock() {
            Some(true) => self.true_branch.compensate(output, foundry, cancel).await,
            Some(false) => {
                if let Some(branch) = &self.false_branch {
                    branch.compensate(output, foundry, cancel).await
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    async fn dispose(&self) {
        self.true_branch.dispose().await;
        if let Some(b) = &self.false_branch {
            b.dispose().await;
        }
    }
}

/// How input is distributed to for-each children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStrategy {
    /// Every child receives the same input.
    Shared,
    /// Input must be a finite sequence of length N (or fewer); child `i`
    /// receives element `i`.
    Split,
    /// Children receive `Value::Null`.
    None,
}

/// Per-child outcome of a for-each run, used both for forward aggregation
/// and compensation reporting.
#[derive(Debug, Clone)]
pub struct ChildOutcome {
    pub index: usize,
    pub operation_name: String,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Runs N child operations concurrently under a concurrency cap, with a
/// data-distribution strategy and optional timeout.
pub struct ForEachOperation {
    id: OperationId,
    name: String,
    children: Vec<Arc<dyn Operation>>,
    concurrency: usize,
    timeout: Option<Duration>,
    strategy: DataStrategy,
    continue_on_error: bool,
    /// Completed children, recorded so compensation can run only over the
    /// ones that actually produced an output.
    completed: parking_lot::Mutex<HashMap<usize, Value>>,
}

impl ForEachOperation {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Operation>>) -> Self {
        Self {
            id: OperationId::new(),
            name: name.into(),
            children,
            concurrency: usize::MAX,
            timeout: None,
            strategy: DataStrategy::Shared,
            continue_on_error: false,
            completed: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_concurrency(mut self, k: usize) -> Self {
        self.concurrency = k.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_strategy(mut self, strategy: DataStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// If set, remaining children keep running after one fails instead of
    /// being cancelled.
    pub fn continue_on_error(mut self, v: bool) -> Self {
        self.continue_on_error = v;
        self
    }

    fn child_inputs(&self, input: &Value) -> Result<Vec<Value>> {
        match self.strategy {
            DataStrategy::Shared => Ok(vec![input.clone(); self.children.len()]),
            DataStrategy::None => Ok(vec![Value::Null; self.children.len()]),
            DataStrategy::Split => {
                let arr = input.as_array().ok_or_else(|| {
                    ForgeError::SplitArityMismatch {
                        expected: self.children.len(),
                        actual: 0,
                    }
                })?;
                if arr.len() > self.children.len() {
                    return Err(ForgeError::SplitArityMismatch {
                        expected: self.children.len(),
                        actual: arr.len(),
                    });
                }
                let mut inputs: Vec<Value> = arr.clone();
                inputs.resize(self.children.len(), Value::Null);
                Ok(inputs)
            }
        }
    }
}

#[async_trait]
impl Operation for ForEachOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_restore(&self) -> bool {
        self.children.iter().any(|c| c.supports_restore())
    }

    async fn forward(&self, input: Value, foundry: &Foundry, cancel: &CancellationToken) -> Result<Value> {
        let inputs = self.child_inputs(&input)?;
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let group_cancel = cancel.child_token();
        let timeout = self.timeout;
        let continue_on_error = self.continue_on_error;

        let mut join_set = tokio::task::JoinSet::new();
        for (index, (child, child_input)) in self.children.iter().cloned().zip(inputs).enumerate() {
            let permit_factory = semaphore.clone();
            let child_cancel = group_cancel.child_token();
            let foundry = foundry.clone();
            join_set.spawn(async move {
                let _permit = permit_factory.acquire_owned().await.ok();
                let name = child.name().to_string();
                let fut = child.forward(child_input, &foundry, &child_cancel);
                let result = match timeout {
                    Some(t) => match tokio::time::timeout(t, fut).await {
                        Ok(r) => r,
                        Err(_) => Err(ForgeError::Cancelled),
                    },
                    None => fut.await,
                };
                (index, name, result)
            });
        }

        let mut outcomes: Vec<ChildOutcome> = Vec::with_capacity(self.children.len());
        let mut first_error: Option<String> = None;

        while let Some(joined) = join_set.join_next().await {
            let (index, operation_name, result) =
                joined.map_err(|e| ForgeError::Persistence(format!("child task join error: {e}")))?;

            match result {
                Ok(output) => {
                    self.completed.lock().insert(index, output.clone());
                    outcomes.push(ChildOutcome {
                        index,
                        operation_name,
                        output: Some(output),
                        error: None,
                    });
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e.to_string());
                    }
                    outcomes.push(ChildOutcome {
                        index,
                        operation_name,
                        output: None,
                        error: Some(e.to_string()),
                    });
                    if !continue_on_error {
                        group_cancel.cancel();
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(ForgeError::Persistence(format!(
                "for-each '{}' failed: {err} ({} of {} children failed)",
                self.name,
                outcomes.iter().filter(|o| o.error.is_some()).count(),
                outcomes.len()
            )));
        }

        outcomes.sort_by_key(|o| o.index);
        Ok(Value::Array(
            outcomes.into_iter().filter_map(|o| o.output).collect(),
        ))
    }

    async fn compensate(&self, _output: Value, foundry: &Foundry, cancel: &CancellationToken) -> Result<()> {
        let completed: Vec<(usize, Value)> = self.completed.lock().drain().collect();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let mut join_set = tokio::task::JoinSet::new();

        for (index, output) in completed {
            let child = self.children[index].clone();
            let permit_factory = semaphore.clone();
            let foundry = foundry.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = permit_factory.acquire_owned().await.ok();
                child.compensate(output, &foundry, &cancel).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Err(e)) = joined {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn dispose(&self) {
        for child in &self.children {
            child.dispose().await;
        }
    }
}
