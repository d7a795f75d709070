use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::ObjectApi;

/// Verify that a user-supplied governing service exists in `namespace` and
/// that its selector picks pods carrying `selector_labels`.
///
/// `api` must be scoped to `namespace`; the namespace is used for messages.
pub async fn ensure_custom_governing_service<A>(
    api: &A,
    namespace: &str,
    service_name: &str,
    selector_labels: &BTreeMap<String, String>,
) -> Result<()>
where
    A: ObjectApi<Service> + ?Sized,
{
    let svc = api.get(service_name).await.map_err(|source| Error::GoverningServiceLookup {
        namespace: namespace.to_string(),
        name: service_name.to_string(),
        source,
    })?;
    let selector = svc.spec.as_ref().and_then(|s| s.selector.as_ref());
    let matches = selector.map_or(true, |sel| sel.iter().all(|(k, v)| selector_labels.get(k) == Some(v)));
    if !matches {
        return Err(Error::GoverningServiceMismatch {
            namespace: namespace.to_string(),
            name: service_name.to_string(),
            selector: selector.map(render).unwrap_or_default(),
            labels: render(selector_labels),
        });
    }
    debug!(ns = namespace, name = service_name, "custom governing service selects pods");
    Ok(())
}

fn render(m: &BTreeMap<String, String>) -> String {
    m.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}
