//! Error types for the reconcile operations

use kube::error::ErrorResponse;
use thiserror::Error;

/// Store errors are carried unaltered in [`Error::Api`] so callers can
/// classify them with the `is_*` helpers.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] kube::Error),

    #[error("failed to update StatefulSet: {0}")]
    StatefulSetUpdate(#[source] Box<Error>),

    #[error("cancelled while backing off after {attempts} attempt(s): {last}")]
    Cancelled {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("failed to get custom governing service {namespace}/{name}: {source}")]
    GoverningServiceLookup {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("custom governing service {namespace}/{name} with selector {selector:?} does not select pods with labels {labels:?}")]
    GoverningServiceMismatch { namespace: String, name: String, selector: String, labels: String },

    #[error("encoding patch: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Status returned by the API server, if this error carries one.
    pub fn api_status(&self) -> Option<&ErrorResponse> {
        match self {
            Error::Api(e) => status(e),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::Api(e) if is_not_found(e)) }

    pub fn is_conflict(&self) -> bool { matches!(self, Error::Api(e) if is_conflict(e)) }

    pub fn is_already_exists(&self) -> bool { matches!(self, Error::Api(e) if is_already_exists(e)) }

    pub fn is_invalid(&self) -> bool { matches!(self, Error::Api(e) if is_invalid(e)) }
}

pub fn status(e: &kube::Error) -> Option<&ErrorResponse> {
    match e {
        kube::Error::Api(ae) => Some(ae),
        _ => None,
    }
}

const KNOWN_REASONS: &[&str] = &["NotFound", "AlreadyExists", "Conflict", "Invalid", "Forbidden", "Unauthorized", "Gone"];

// A reason the client does not know is classified by status code alone.
fn classify(e: &kube::Error, reason: &str, code: u16) -> bool {
    status(e).is_some_and(|s| s.reason == reason || (s.code == code && !KNOWN_REASONS.contains(&s.reason.as_str())))
}

pub fn is_not_found(e: &kube::Error) -> bool { classify(e, "NotFound", 404) }

/// Write rejected because the version token was stale.
pub fn is_conflict(e: &kube::Error) -> bool { classify(e, "Conflict", 409) }

pub fn is_already_exists(e: &kube::Error) -> bool { classify(e, "AlreadyExists", 409) }

/// 422 rejection, e.g. an attempted change of an immutable field.
pub fn is_invalid(e: &kube::Error) -> bool { status(e).is_some_and(|s| s.code == 422 && s.reason == "Invalid") }
