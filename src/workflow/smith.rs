//! Smith: the orchestrator that drives a [`Workflow`] through a [`Foundry`],
//! including saga-style compensation on failure.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{CompensationEvent, EventBus, WorkflowEvent};
use super::foundry::Foundry;
use super::operation::Operation;
use super::workflow::Workflow;
use crate::error::{FailedCompensation, ForgeError, Result};
use crate::logging::{Fields, LogLevel, Logger, TracingLogger};
use crate::options::ForgeOptions;
use crate::persistence::PersistenceMiddleware;
use crate::value::Value;

/// One entry on the compensation stack: an operation that completed
/// forward and declared it supports restore, paired with the output it
/// produced (the input `compensate` needs to undo it).
struct CompletedStep {
    operation: Arc<dyn Operation>,
    output: Value,
}

/// Drives workflow executions against a [`Foundry`]. A single `Smith` can
/// run many workflows over its lifetime (optionally bounding how many run
/// concurrently via [`ForgeOptions::max_concurrent_workflows`]); each call
/// to [`Smith::forge`] owns one [`Foundry`] for the run's duration.
pub struct Smith {
    options: ForgeOptions,
    concurrency: Option<Arc<Semaphore>>,
    workflow_events: EventBus<WorkflowEvent>,
    compensation_events: EventBus<CompensationEvent>,
    persistence: Option<Arc<PersistenceMiddleware>>,
    logger: Arc<dyn Logger>,
}

impl Smith {
    /// Build a `Smith`, validating `options` up front so a misconfigured
    /// smith never gets as far as freezing a foundry before failing.
    pub fn new(options: ForgeOptions) -> Result<Self> {
        options.validate()?;
        let concurrency = if options.max_concurrent_workflows > 0 {
            Some(Arc::new(Semaphore::new(options.max_concurrent_workflows)))
        } else {
            None
        };
        Ok(Self {
            options,
            concurrency,
            workflow_events: EventBus::new(),
            compensation_events: EventBus::new(),
            persistence: None,
            logger: Arc::new(TracingLogger),
        })
    }

    /// Attach a persistence middleware so a completed saga unwind
    /// automatically deletes its snapshot: once compensation finishes,
    /// there is nothing left to resume into.
    pub fn with_persistence(mut self, persistence: Arc<PersistenceMiddleware>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn options(&self) -> &ForgeOptions {
        &self.options
    }

    pub fn on_workflow_event<F>(&self, handler: F)
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.workflow_events.subscribe(handler);
    }

    pub fn on_compensation_event<F>(&self, handler: F)
    where
        F: Fn(&CompensationEvent) + Send + Sync + 'static,
    {
        self.compensation_events.subscribe(handler);
    }

    fn log_workflow(&self, level: LogLevel, workflow: &Workflow, execution_id: Uuid, message: &str) {
        let mut fields = Fields::new();
        fields.insert("workflow_id".into(), Value::from(workflow.id.to_string()));
        fields.insert("workflow_name".into(), Value::from(workflow.name.clone()));
        fields.insert("execution_id".into(), Value::from(execution_id.to_string()));
        self.logger.log(level, message, fields);
    }

    /// Run `workflow` against `foundry`, starting from `input`.
    ///
    /// Binds the workflow to the foundry, freezes it for the run's
    /// duration, and executes operations in order with output chaining
    /// (when enabled). On a step failure, unwinds by compensating every
    /// completed, restore-capable step in reverse order, unless
    /// `continue_on_error` is set, in which case the run keeps going and
    /// surfaces an aggregate error instead of compensating.
    pub async fn forge(
        &self,
        workflow: Workflow,
        foundry: &Foundry,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if foundry.is_frozen() {
            return Err(ForgeError::PipelineFrozen);
        }

        let _permit = match &self.concurrency {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ForgeError::Cancelled)?,
            ),
            None => None,
        };

        foundry.bind_workflow(workflow.clone())?;
        foundry.freeze();
        let started = Instant::now();

        self.workflow_events.emit(&WorkflowEvent::Started {
            workflow_id: workflow.id.as_uuid(),
            workflow_name: workflow.name.clone(),
            execution_id: foundry.execution_id(),
        });
        self.log_workflow(
            LogLevel::Information,
            &workflow,
            foundry.execution_id(),
            "workflow started",
        );

        // A workflow timeout links into the run's own cancellation: once it
        // elapses, `run_cancel` is cancelled the same way an external caller
        // cancelling `cancel` would cancel it, so every cancellation check
        // already in the step loop and in for-each children picks it up.
        let run_cancel = cancel.child_token();
        let timeout_guard = self.options.workflow_timeout.map(|d| {
            let t = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(d).await;
                t.cancel();
            })
        });

        let result = self.run_operations(&workflow, foundry, input, &run_cancel).await;

        if let Some(handle) = timeout_guard {
            handle.abort();
        }

        foundry.unfreeze();

        match &result {
            Ok(_) => {
                self.workflow_events.emit(&WorkflowEvent::Completed {
                    execution_id: foundry.execution_id(),
                    duration: started.elapsed(),
                });
                self.log_workflow(
                    LogLevel::Information,
                    &workflow,
                    foundry.execution_id(),
                    "workflow completed",
                );
            }
            Err(e) => {
                self.workflow_events.emit(&WorkflowEvent::Failed {
                    execution_id: foundry.execution_id(),
                    error: e.to_string(),
                    failed_operation_name: failed_operation_name(e),
                });
                self.log_workflow(
                    LogLevel::Error,
                    &workflow,
                    foundry.execution_id(),
                    &format!("workflow failed: {e}"),
                );
            }
        }

        if foundry.auto_dispose_operations() {
            for op in foundry.operation_sequence() {
                op.dispose().await;
            }
        }

        result
    }

    async fn run_operations(
        &self,
        workflow: &Workflow,
        foundry: &Foundry,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut current = input;
        let mut completed: Vec<CompletedStep> = Vec::new();
        let mut aggregate_errors: Vec<ForgeError> = Vec::new();
        let operations = foundry.operation_sequence();

        for (index, operation) in operations.iter().enumerate() {
            if cancel.is_cancelled() {
                return self
                    .compensate_and_fail(workflow, foundry, completed, ForgeError::Cancelled, cancel)
                    .await;
            }

            let step_input = current.clone();
            match foundry
                .run_step(
                    operation.as_ref(),
                    index,
                    step_input.clone(),
                    cancel,
                    self.options.default_operation_timeout,
                )
                .await
            {
                Ok(output) => {
                    if operation.supports_restore() {
                        completed.push(CompletedStep {
                            operation: operation.clone(),
                            output: output.clone(),
                        });
                    }
                    if self.options.enable_output_chaining {
                        current = output;
                    }
                }
                Err(e) => {
                    let wrapped = ForgeError::OperationFailure {
                        operation_id: operation.id(),
                        operation_name: operation.name().to_string(),
                        input: step_input,
                        source: Box::new(e),
                    };
                    if self.options.continue_on_error {
                        aggregate_errors.push(wrapped);
                        continue;
                    }
                    return self
                        .compensate_and_fail(workflow, foundry, completed, wrapped, cancel)
                        .await;
                }
            }
        }

        if !aggregate_errors.is_empty() {
            return Err(ForgeError::AggregateRunFailure {
                errors: aggregate_errors,
            });
        }

        Ok(current)
    }

    /// Unwind `completed` in reverse (LIFO) order, then return `cause` (or
    /// a `CompensationFailure` in its place, when `throw_on_compensation_error`
    /// is set and at least one restore failed). If a persistence middleware
    /// is attached, its snapshot is deleted once compensation finishes: a
    /// compensated run has been rolled back and must not look resumable.
    async fn compensate_and_fail(
        &self,
        workflow: &Workflow,
        foundry: &Foundry,
        completed: Vec<CompletedStep>,
        cause: ForgeError,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let started = Instant::now();
        self.compensation_events.emit(&CompensationEvent::Triggered {
            reason: cause.to_string(),
            failed_operation_name: failed_operation_name(&cause),
            error: cause.to_string(),
        });
        self.log_workflow(
            LogLevel::Warning,
            workflow,
            foundry.execution_id(),
            &format!("compensation triggered: {cause}"),
        );

        let mut failed: Vec<FailedCompensation> = Vec::new();
        let mut successful = 0usize;

        for step in completed.into_iter().rev() {
            let id = step.operation.id();
            let name = step.operation.name().to_string();

            self.compensation_events
                .emit(&CompensationEvent::OperationRestoreStarted {
                    operation_id: id,
                    operation_name: name.clone(),
                });

            match step.operation.compensate(step.output, foundry, cancel).await {
                Ok(()) => {
                    successful += 1;
                    self.compensation_events
                        .emit(&CompensationEvent::OperationRestoreCompleted {
                            operation_id: id,
                            operation_name: name,
                        });
                }
                Err(e) => {
                    self.compensation_events
                        .emit(&CompensationEvent::OperationRestoreFailed {
                            operation_id: id,
                            operation_name: name.clone(),
                            error: e.to_string(),
                        });
                    failed.push(FailedCompensation {
                        operation_id: id,
                        operation_name: name,
                        error: e.to_string(),
                    });
                    if self.options.fail_fast_compensation {
                        break;
                    }
                }
            }
        }

        self.compensation_events.emit(&CompensationEvent::Completed {
            successful_restores: successful,
            failed_restores: failed.len(),
            duration: started.elapsed(),
        });
        self.log_workflow(
            if failed.is_empty() { LogLevel::Information } else { LogLevel::Error },
            workflow,
            foundry.execution_id(),
            &format!(
                "compensation completed: {successful} succeeded, {} failed",
                failed.len()
            ),
        );

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.delete(foundry, workflow.id).await {
                self.log_workflow(
                    LogLevel::Warning,
                    workflow,
                    foundry.execution_id(),
                    &format!("failed to delete snapshot after compensation: {e}"),
                );
            }
        }

        if !failed.is_empty() && self.options.throw_on_compensation_error {
            Err(ForgeError::CompensationFailure { failed })
        } else {
            Err(cause)
        }
    }
}

fn failed_operation_name(error: &ForgeError) -> Option<String> {
    match error {
        ForgeError::OperationFailure { operation_name, .. } => Some(operation_name.clone()),
        _ => None,
    }
}
