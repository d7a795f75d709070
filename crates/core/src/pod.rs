use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PodError {
    #[error("pod completed with phase {0}")]
    Completed(String),
    #[error("pod ready condition not found")]
    ReadyConditionMissing,
}

/// Whether the pod is running and reports the `Ready` condition as true.
pub fn pod_running_and_ready(pod: &Pod) -> Result<bool, PodError> {
    let Some(status) = pod.status.as_ref() else { return Ok(false) };
    match status.phase.as_deref() {
        Some(phase @ ("Failed" | "Succeeded")) => Err(PodError::Completed(phase.to_string())),
        Some("Running") => status
            .conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|c| c.type_ == "Ready")
            .map(|c| c.status == "True")
            .ok_or(PodError::ReadyConditionMissing),
        _ => Ok(false),
    }
}
