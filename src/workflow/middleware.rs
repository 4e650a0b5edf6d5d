//! Middleware and the Russian-doll composition chain.
//!
//! [`Next`] is a cheap, copyable cursor into a middleware slice; calling it
//! recurses one step further in rather than invoking a pre-built closure
//! tree. This gives `M1 → M2 → M3 → operation → M3 → M2 → M1` ordering
//! without allocating a new closure per step, and — deliberately — lets a
//! middleware call `next` more than once (a retry middleware re-entering
//! the remainder of the chain after a failure) even though well-behaved
//! middleware should only ever call it once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::operation::Operation;
use super::Foundry;
use crate::error::Result;
use crate::value::Value;

/// A cursor pointing at "the remainder of the chain" from some middleware's
/// point of view. Calling `call` runs the next middleware in the pipeline,
/// or the operation's `forward` once the cursor reaches the end.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    index: usize,
    operation: &'a dyn Operation,
    foundry: &'a Foundry,
    cancel: &'a CancellationToken,
}

impl<'a> Next<'a> {
    pub async fn call(&self, input: Value) -> Result<Value> {
        invoke_chain(
            self.middlewares,
            self.index,
            self.operation,
            self.foundry,
            input,
            self.cancel,
        )
        .await
    }
}

/// A wrapper around each operation step, composed into the pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn execute(
        &self,
        operation: &dyn Operation,
        foundry: &Foundry,
        input: Value,
        next: Next<'_>,
        cancel: &CancellationToken,
    ) -> Result<Value>;
}

/// Compose and invoke the chain starting at `index`. `index == middlewares.len()`
/// is the base case: invoke the operation's forward behaviour directly.
pub(crate) fn invoke_chain<'a>(
    middlewares: &'a [Arc<dyn Middleware>],
    index: usize,
    operation: &'a dyn Operation,
    foundry: &'a Foundry,
    input: Value,
    cancel: &'a CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
    Box::pin(async move {
        if index >= middlewares.len() {
            return operation.forward(input, foundry, cancel).await;
        }

        let next = Next {
            middlewares,
            index: index + 1,
            operation,
            foundry,
            cancel,
        };

        middlewares[index]
            .execute(operation, foundry, input, next, cancel)
            .await
    })
}
