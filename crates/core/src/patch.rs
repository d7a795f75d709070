//! Typed RFC 6902 JSON patches.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A single JSON patch operation. Only the verbs the toolkit emits are modelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Json },
    Test { path: String, value: Json },
    Remove { path: String },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. } | PatchOperation::Test { path, .. } | PatchOperation::Remove { path } => path,
        }
    }
}

/// An ordered list of operations applied atomically by the API server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonPatch(pub Vec<PatchOperation>);

impl JsonPatch {
    pub fn operations(&self) -> &[PatchOperation] { &self.0 }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn to_json(&self) -> serde_json::Result<Json> { serde_json::to_value(self) }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> { serde_json::to_vec(self) }
}

impl From<Vec<PatchOperation>> for JsonPatch {
    fn from(ops: Vec<PatchOperation>) -> Self { Self(ops) }
}
