use std::sync::atomic::{AtomicBool, Ordering};

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::PropagationPolicy;
use kube::error::ErrorResponse;
use kube::Resource;
use tracing::warn;

use crate::error::{Error, Result};
use crate::reconcile::Reconciler;
use crate::store::ObjectApi;

/// Outcome of [`Reconciler::force_update_stateful_set`].
#[derive(Debug, Clone)]
pub enum ForceUpdate {
    Updated(Box<StatefulSet>),
    /// The update touched immutable fields; the StatefulSet was deleted
    /// with foreground propagation so the next reconcile recreates it.
    Deleted,
}

impl Reconciler {
    /// Update a StatefulSet, falling back to deleting it when the API server
    /// rejects the change as invalid (e.g. a new `spec.selector`).
    ///
    /// `on_delete` receives the rejection causes before the delete is issued.
    /// A missing StatefulSet is created; a rejected create is returned
    /// without deleting anything.
    pub async fn force_update_stateful_set<A, F>(
        &self,
        api: &A,
        desired: &StatefulSet,
        on_delete: Option<F>,
    ) -> Result<ForceUpdate>
    where
        A: ObjectApi<StatefulSet> + ?Sized,
        F: FnOnce(&str),
    {
        let replaced = AtomicBool::new(false);
        let err = match self.upsert(api, desired, &replaced).await {
            Ok(sts) => return Ok(ForceUpdate::Updated(Box::new(sts))),
            Err(e) => e,
        };
        if !err.is_invalid() || !replaced.load(Ordering::Relaxed) {
            return Err(Error::StatefulSetUpdate(Box::new(err)));
        }
        let causes = err.api_status().map(invalid_causes).unwrap_or_default();
        let name = desired.meta().name.as_deref().unwrap_or_default();
        warn!(name, causes = %causes, "StatefulSet update rejected; deleting for recreation");
        if let Some(f) = on_delete {
            f(&causes);
        }
        api.delete(name, PropagationPolicy::Foreground).await?;
        metrics::counter!("statefulset_recreate_total", 1u64);
        Ok(ForceUpdate::Deleted)
    }
}

/// Cause messages of an Invalid rejection, joined with `", "`.
///
/// The API server renders them after `is invalid: `, bracketed when there is
/// more than one.
pub fn invalid_causes(status: &ErrorResponse) -> String {
    let msg = status.message.as_str();
    let causes = msg.split_once(" is invalid: ").map_or(msg, |(_, c)| c);
    causes.strip_prefix('[').and_then(|c| c.strip_suffix(']')).unwrap_or(causes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid(message: &str) -> ErrorResponse {
        ErrorResponse { status: "Failure".into(), message: message.into(), reason: "Invalid".into(), code: 422 }
    }

    #[test]
    fn single_cause() {
        let s = invalid(r#"StatefulSet.apps "web" is invalid: spec: Forbidden: updates to statefulset spec are forbidden"#);
        assert_eq!(invalid_causes(&s), "spec: Forbidden: updates to statefulset spec are forbidden");
    }

    #[test]
    fn bracketed_causes() {
        let s = invalid(r#"StatefulSet.apps "web" is invalid: [spec.selector: Invalid value, spec: Forbidden: nope]"#);
        assert_eq!(invalid_causes(&s), "spec.selector: Invalid value, spec: Forbidden: nope");
    }

    #[test]
    fn unstructured_message_is_kept() {
        assert_eq!(invalid_causes(&invalid("bad request")), "bad request");
    }
}
