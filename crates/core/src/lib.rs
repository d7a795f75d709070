//! Converge core: pure building blocks shared by the reconcile operations.
//!
//! Nothing in this crate talks to a cluster. Naming, metadata merging and
//! finalizer patch generation are deterministic functions over k8s-openapi
//! types so they can be tested without a store.

#![forbid(unsafe_code)]

pub mod finalizer;
pub mod merge;
pub mod namer;
pub mod patch;
pub mod pod;

pub use finalizer::{add_patch, delete_patch, has_finalizer, STATUS_CLEANUP_FINALIZER};
pub use merge::{merge_kubectl_annotations, merge_metadata, merge_owner_references, KUBECTL_ANNOTATION_PREFIX};
pub use namer::{is_dns1123_label, NameError, ResourceNamer, DNS1123_LABEL_MAX_LENGTH};
pub use patch::{JsonPatch, PatchOperation};
pub use pod::{pod_running_and_ready, PodError};

pub mod prelude {
    pub use super::{
        add_patch, delete_patch, merge_kubectl_annotations, merge_metadata, merge_owner_references, JsonPatch,
        NameError, PatchOperation, ResourceNamer,
    };
}
