//! Bounded, backoff-governed recovery of runs left behind by an earlier
//! process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::provider::RecoveryCatalog;
use super::snapshot::Snapshot;
use crate::error::{ForgeError, Result};
use crate::logging::{Fields, LogLevel, Logger};
use crate::value::Value;

/// Exponential backoff with a cap and jitter, applied between retries of
/// one recovering run (not between distinct runs — those are independent
/// and all get attempted in the same pass).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-indexed: the delay before the
    /// *second* attempt is `attempt == 2`). Jitter is +/-20% of the
    /// computed delay, so concurrent recoveries don't retry in lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(capped * jitter)
    }

    /// Validate the policy, raising `ConfigurationError` for values that
    /// can never produce a sane retry schedule.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ForgeError::ConfigurationError(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ForgeError::ConfigurationError(format!(
                "initial_backoff ({:?}) exceeds max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            )));
        }
        if self.multiplier < 1.0 {
            return Err(ForgeError::ConfigurationError(
                "multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of attempting to recover one snapshot.
#[derive(Debug)]
pub struct RecoveryOutcome {
    pub foundry_key: String,
    pub workflow_key: String,
    pub attempts: u32,
    pub result: Result<Value>,
}

/// Drives a recovery pass: lists pending snapshots from a [`RecoveryCatalog`]
/// and retries each one, with backoff, up to `policy.max_attempts` times.
///
/// The caller supplies `resume`, a closure that knows how to turn one
/// [`Snapshot`] back into a running workflow (rebuilding the `Workflow`
/// definition, a `Foundry` with the snapshot's properties restored, and an
/// input value) and returns its final result — typically a thin wrapper
/// around [`crate::workflow::Smith::forge`].
pub struct RecoveryCoordinator {
    catalog: Arc<dyn RecoveryCatalog>,
    policy: RetryPolicy,
    logger: Arc<dyn Logger>,
}

impl RecoveryCoordinator {
    /// Build a `RecoveryCoordinator`, validating `policy` up front.
    pub fn new(
        catalog: Arc<dyn RecoveryCatalog>,
        policy: RetryPolicy,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            catalog,
            policy,
            logger,
        })
    }

    pub async fn recover_all<F, Fut>(&self, cancel: &CancellationToken, resume: F) -> Vec<RecoveryOutcome>
    where
        F: Fn(Snapshot) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let pending = match self.catalog.list_pending().await {
            Ok(p) => p,
            Err(e) => {
                self.logger.log(
                    LogLevel::Error,
                    "failed to list pending snapshots for recovery",
                    Fields::from([("error".to_string(), Value::from(e.to_string()))]),
                );
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(pending.len());
        for snapshot in pending {
            outcomes.push(self.recover_one(&snapshot, cancel, &resume).await);
        }
        outcomes
    }

    async fn recover_one<F, Fut>(
        &self,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
        resume: &F,
    ) -> RecoveryOutcome
    where
        F: Fn(Snapshot) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return RecoveryOutcome {
                    foundry_key: snapshot.foundry_key.clone(),
                    workflow_key: snapshot.workflow_key.clone(),
                    attempts: attempt,
                    result: Err(ForgeError::Cancelled),
                };
            }

            let result = resume(snapshot.clone()).await;
            match result {
                Ok(value) => {
                    return RecoveryOutcome {
                        foundry_key: snapshot.foundry_key.clone(),
                        workflow_key: snapshot.workflow_key.clone(),
                        attempts: attempt,
                        result: Ok(value),
                    };
                }
                Err(e) if attempt < self.policy.max_attempts => {
                    self.logger.log(
                        LogLevel::Warning,
                        "recovery attempt failed, retrying",
                        Fields::from([
                            ("foundry_key".to_string(), Value::from(snapshot.foundry_key.clone())),
                            ("attempt".to_string(), Value::from(attempt)),
                            ("error".to_string(), Value::from(e.to_string())),
                        ]),
                    );
                    tokio::time::sleep(self.policy.delay_for(attempt + 1)).await;
                }
                Err(e) => {
                    return RecoveryOutcome {
                        foundry_key: snapshot.foundry_key.clone(),
                        workflow_key: snapshot.workflow_key.clone(),
                        attempts: attempt,
                        result: Err(e),
                    };
                }
            }
        }
    }
}
