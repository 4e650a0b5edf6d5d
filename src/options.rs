//! Execution options for a workflow run.
//!
//! Plain, serializable structs with builder-style setters, validated at
//! construction time. Hosts build `ForgeOptions` directly in code; there is
//! no file-loading layer here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};

/// Execution options recognized by [`crate::workflow::Smith`] and
/// [`crate::workflow::Foundry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeOptions {
    /// 0 = unlimited concurrent workflow runs sharing this Smith.
    pub max_concurrent_workflows: usize,
    /// If set, per-operation errors are aggregated instead of stopping the
    /// run; compensation is not triggered on this path.
    pub continue_on_error: bool,
    /// If set, compensation stops at the first failed restore.
    pub fail_fast_compensation: bool,
    /// If set, compensation failures are surfaced to the caller instead of
    /// being logged and swallowed.
    pub throw_on_compensation_error: bool,
    /// If set, each operation's output becomes the next operation's input.
    pub enable_output_chaining: bool,
    /// Default per-operation timeout, used when an operation doesn't set
    /// its own.
    #[serde(with = "duration_millis_opt")]
    pub default_operation_timeout: Option<Duration>,
    /// Overall workflow timeout.
    #[serde(with = "duration_millis_opt")]
    pub workflow_timeout: Option<Duration>,
}

impl Default for ForgeOptions {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 0,
            continue_on_error: false,
            fail_fast_compensation: false,
            throw_on_compensation_error: false,
            enable_output_chaining: false,
            default_operation_timeout: None,
            workflow_timeout: None,
        }
    }
}

impl ForgeOptions {
    pub fn builder() -> ForgeOptionsBuilder {
        ForgeOptionsBuilder::default()
    }

    /// Validate the options, raising `ConfigurationError` for values that
    /// can never be satisfied.
    pub fn validate(&self) -> Result<()> {
        if let (Some(op), Some(wf)) = (self.default_operation_timeout, self.workflow_timeout) {
            if op > wf {
                return Err(ForgeError::ConfigurationError(format!(
                    "default_operation_timeout ({op:?}) exceeds workflow_timeout ({wf:?})"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ForgeOptionsBuilder {
    inner: ForgeOptions,
}

impl ForgeOptionsBuilder {
    pub fn max_concurrent_workflows(mut self, n: usize) -> Self {
        self.inner.max_concurrent_workflows = n;
        self
    }
    pub fn continue_on_error(mut self, v: bool) -> Self {
        self.inner.continue_on_error = v;
        self
    }
    pub fn fail_fast_compensation(mut self, v: bool) -> Self {
        self.inner.fail_fast_compensation = v;
        self
    }
    pub fn throw_on_compensation_error(mut self, v: bool) -> Self {
        self.inner.throw_on_compensation_error = v;
        self
    }
    pub fn enable_output_chaining(mut self, v: bool) -> Self {
        self.inner.enable_output_chaining = v;
        self
    }
    pub fn default_operation_timeout(mut self, d: Duration) -> Self {
        self.inner.default_operation_timeout = Some(d);
        self
    }
    pub fn workflow_timeout(mut self, d: Duration) -> Self {
        self.inner.workflow_timeout = Some(d);
        self
    }
    pub fn build(self) -> Result<ForgeOptions> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

/// Options controlling snapshot persistence, layered on top of
/// [`ForgeOptions`] when a `PersistenceProvider` is installed on a Foundry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceOptions {
    pub persist_on_operation_complete: bool,
    pub persist_on_workflow_complete: bool,
    pub persist_on_failure: bool,
    /// Providers MAY retain up to this many historical snapshot versions.
    pub max_versions: u32,
    /// Stable identity for this Foundry's logical run, used to derive
    /// `foundry_key`. Falls back to the Foundry's `execution_id` if unset.
    pub instance_id: Option<String>,
    /// Stable identity for the workflow definition, used to derive
    /// `workflow_key`. Falls back to the workflow's `id` if unset.
    pub workflow_key: Option<String>,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            persist_on_operation_complete: true,
            persist_on_workflow_complete: true,
            persist_on_failure: false,
            max_versions: 1,
            instance_id: None,
            workflow_key: None,
        }
    }
}

impl PersistenceOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_versions == 0 {
            return Err(ForgeError::ConfigurationError(
                "max_versions must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

mod duration_millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let millis: Option<u64> = Option::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert!(ForgeOptions::default().validate().is_ok());
    }

    #[test]
    fn operation_timeout_exceeding_workflow_timeout_is_rejected() {
        let err = ForgeOptions::builder()
            .default_operation_timeout(Duration::from_secs(10))
            .workflow_timeout(Duration::from_secs(5))
            .build()
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConfigurationError(_)));
    }

    #[test]
    fn persistence_options_reject_zero_max_versions() {
        let opts = PersistenceOptions {
            max_versions: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
