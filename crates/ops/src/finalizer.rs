//! Finalizer maintenance through positional JSON patches.

use converge_core::{add_patch, delete_patch, JsonPatch};
use kube::Resource;
use tracing::debug;

use crate::error::Result;
use crate::store::ObjectApi;

/// Add `finalizer` to the named object. Returns the patched object, or
/// `None` when it was already present.
pub async fn ensure_finalizer<K, A>(api: &A, name: &str, finalizer: &str) -> Result<Option<K>>
where
    K: Resource + Send + Sync,
    A: ObjectApi<K> + ?Sized,
{
    let live = api.get(name).await?;
    let patch = add_patch(finalizers(&live), finalizer);
    submit(api, name, patch).await
}

/// Remove `finalizer` from the named object. The patch verifies the entry
/// is still at the observed index, so a list that shifted in between is
/// rejected by the store; re-read and call again.
pub async fn remove_finalizer<K, A>(api: &A, name: &str, finalizer: &str) -> Result<Option<K>>
where
    K: Resource + Send + Sync,
    A: ObjectApi<K> + ?Sized,
{
    let live = api.get(name).await?;
    let patch = delete_patch(finalizers(&live), finalizer);
    submit(api, name, patch).await
}

fn finalizers<K: Resource>(obj: &K) -> &[String] { obj.meta().finalizers.as_deref().unwrap_or_default() }

async fn submit<K, A>(api: &A, name: &str, patch: Option<JsonPatch>) -> Result<Option<K>>
where
    A: ObjectApi<K> + ?Sized,
{
    let Some(patch) = patch else {
        debug!(name, "finalizers already in desired state");
        return Ok(None);
    };
    debug!(name, ops = patch.operations().len(), "patching finalizers");
    Ok(Some(api.patch_json(name, &patch).await?))
}
