//! Finalizer add/remove patches.
//!
//! Both generators return `None` when the object already has the desired
//! state, so callers only send a request when something changes.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;

use crate::patch::{JsonPatch, PatchOperation};

/// Finalizer used to garbage collect status bindings on configuration resources.
pub const STATUS_CLEANUP_FINALIZER: &str = "monitoring.coreos.com/status-cleanup";

const FINALIZERS_PATH: &str = "/metadata/finalizers";

pub fn has_finalizer(meta: &ObjectMeta, name: &str) -> bool {
    meta.finalizers.as_deref().unwrap_or_default().iter().any(|f| f == name)
}

/// Patch appending `name` to `finalizers`.
pub fn add_patch(finalizers: &[String], name: &str) -> Option<JsonPatch> {
    if finalizers.iter().any(|f| f == name) {
        return None;
    }
    let op = if finalizers.is_empty() {
        // the field may be absent on the live object: set the whole list
        PatchOperation::Add { path: FINALIZERS_PATH.to_string(), value: json!([name]) }
    } else {
        PatchOperation::Add { path: format!("{}/-", FINALIZERS_PATH), value: json!(name) }
    };
    Some(JsonPatch(vec![op]))
}

/// Patch removing the first occurrence of `name`.
///
/// The `test` operation pins the index observed here: if the list shifted
/// before the patch lands, the server rejects the whole patch and the caller
/// has to re-read the object.
pub fn delete_patch(finalizers: &[String], name: &str) -> Option<JsonPatch> {
    let idx = finalizers.iter().position(|f| f == name)?;
    let path = format!("{}/{}", FINALIZERS_PATH, idx);
    Some(JsonPatch(vec![
        PatchOperation::Test { path: path.clone(), value: json!(name) },
        PatchOperation::Remove { path },
    ]))
}
