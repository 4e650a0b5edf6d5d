//! Snapshot: the serializable state a persistence provider saves and loads
//! to let a run resume after a process restart.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::value::Value;
use crate::workflow::WorkflowId;

/// A point-in-time capture of one foundry's property bag, keyed so it can
/// be looked up again by the same foundry/workflow pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub foundry_key: String,
    pub workflow_key: String,
    pub execution_id: Uuid,
    pub properties: HashMap<String, Value>,
    pub completed_operation_indices: Vec<usize>,
    /// Incremented on every save; providers may use it to retain history
    /// up to `PersistenceOptions::max_versions`.
    pub version: u32,
}

/// Derive a stable key for one foundry instance. Uses the configured
/// `instance_id` when set, falling back to the foundry's `execution_id`,
/// then digests the result to a fixed-width, storage-friendly string.
pub fn foundry_key(instance_id: Option<&str>, execution_id: Uuid) -> String {
    let seed = instance_id
        .map(str::to_string)
        .unwrap_or_else(|| execution_id.to_string());
    digest(&seed)
}

/// Derive a stable key for a workflow definition, the same way as
/// [`foundry_key`] but seeded from the configured `workflow_key` or the
/// workflow's own id.
pub fn workflow_key(configured: Option<&str>, workflow_id: WorkflowId) -> String {
    let seed = configured
        .map(str::to_string)
        .unwrap_or_else(|| workflow_id.as_uuid().to_string());
    digest(&seed)
}

fn digest(seed: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(seed.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
