//! Converge ops: conflict-safe reconciliation primitives for operators.
//!
//! Operations are written against the [`ObjectApi`] and [`AccessReviewer`]
//! seams, implemented for `kube::Api`. A [`Reconciler`] carries the retry
//! policy, backoff clock and cancellation token shared by the operations
//! that retry on write conflicts.

#![forbid(unsafe_code)]

pub mod access;
pub mod error;
pub mod finalizer;
pub mod governing;
pub mod reconcile;
pub mod retry;
pub mod statefulset;
pub mod store;

pub use access::{is_allowed, AccessReport, MissingPermission, ResourceAttribute, ALL_NAMESPACES};
pub use error::{Error, Result};
pub use finalizer::{ensure_finalizer, remove_finalizer};
pub use governing::ensure_custom_governing_service;
pub use reconcile::{semantically_equal, Converge, Reconciler, FIELD_MANAGER};
pub use retry::{Clock, RetryPolicy, TokioClock};
pub use statefulset::{invalid_causes, ForceUpdate};
pub use store::{AccessReviewer, ObjectApi};
pub use tokio_util::sync::CancellationToken;
