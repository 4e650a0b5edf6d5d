//! Assertion helpers for exercising workflows in tests. Gated behind the
//! `testing` feature (always available under `#[cfg(test)]` for this
//! crate's own tests).

use crate::error::ForgeError;
use crate::value::Value;

/// Assert that a workflow result is `Ok` and return the unwrapped value,
/// panicking with the error's message otherwise.
#[macro_export]
macro_rules! assert_forged {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("expected workflow to succeed, got error: {e}"),
        }
    };
}

/// Assert that a workflow result failed, and that the formatted error
/// contains `$needle`.
#[macro_export]
macro_rules! assert_forge_failed {
    ($result:expr, $needle:expr) => {
        match $result {
            Ok(v) => panic!("expected workflow to fail, got Ok({v:?})"),
            Err(e) => {
                let message = e.to_string();
                assert!(
                    message.contains($needle),
                    "expected error message to contain {:?}, got {:?}",
                    $needle,
                    message
                );
            }
        }
    };
}

/// Assert a [`ForgeError`] is the `OperationFailure` variant and return the
/// failing operation's name.
pub fn assert_operation_failure(error: &ForgeError) -> &str {
    match error {
        ForgeError::OperationFailure { operation_name, .. } => operation_name,
        other => panic!("expected OperationFailure, got {other:?}"),
    }
}

/// Assert a [`ForgeError`] is `CompensationFailure` and return the names of
/// operations whose compensation failed.
pub fn assert_compensation_failure(error: &ForgeError) -> Vec<&str> {
    match error {
        ForgeError::CompensationFailure { failed } => {
            failed.iter().map(|f| f.operation_name.as_str()).collect()
        }
        other => panic!("expected CompensationFailure, got {other:?}"),
    }
}

/// Build a simple JSON object value from key/value pairs, for compact test
/// fixtures.
pub fn object(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
    Value::Object(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}
