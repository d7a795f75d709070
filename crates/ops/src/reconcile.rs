//! Read-merge-write reconciliation of operator-owned objects.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use converge_core::{merge_kubectl_annotations, merge_metadata, merge_owner_references};
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, PodTemplateSpec, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{is_already_exists, is_not_found, Error, Result};
use crate::retry::{self, Clock, RetryPolicy, TokioClock};
use crate::store::ObjectApi;

/// Field manager recorded on server-side patches.
pub const FIELD_MANAGER: &str = "converge";

/// A kind the reconciler knows how to merge into its live counterpart.
pub trait Converge:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Leave the live object alone when the merged object would not change it.
    const SKIP_UNCHANGED: bool = false;

    /// An object without a name is created directly (server-generated name).
    const CREATE_WHEN_UNNAMED: bool = false;

    /// Copy fields the server refuses to change from the live object.
    fn carry_immutable_fields(&mut self, _observed: &Self) {}

    /// Keep `kubectl.kubernetes.io/` annotations of the live pod template.
    fn carry_template_annotations(&mut self, _observed: &Self) {}
}

impl Converge for Service {
    fn carry_immutable_fields(&mut self, observed: &Self) {
        let Some(live) = observed.spec.as_ref() else { return };
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.ip_families = live.ip_families.clone();
        spec.ip_family_policy = live.ip_family_policy.clone();
        spec.cluster_ip = live.cluster_ip.clone();
        spec.cluster_ips = live.cluster_ips.clone();
    }
}

impl Converge for Endpoints {}

impl Converge for EndpointSlice {
    const CREATE_WHEN_UNNAMED: bool = true;
}

impl Converge for Secret {
    const SKIP_UNCHANGED: bool = true;
}

impl Converge for ConfigMap {
    const SKIP_UNCHANGED: bool = true;
}

impl Converge for DaemonSet {
    fn carry_template_annotations(&mut self, observed: &Self) {
        if let (Some(spec), Some(live)) = (self.spec.as_mut(), observed.spec.as_ref()) {
            carry_kubectl(&mut spec.template, &live.template);
        }
    }
}

impl Converge for StatefulSet {
    fn carry_template_annotations(&mut self, observed: &Self) {
        if let (Some(spec), Some(live)) = (self.spec.as_mut(), observed.spec.as_ref()) {
            carry_kubectl(&mut spec.template, &live.template);
        }
    }
}

fn carry_kubectl(desired: &mut PodTemplateSpec, observed: &PodTemplateSpec) {
    if let Some(live) = observed.metadata.as_ref().filter(|m| m.annotations.is_some()) {
        merge_kubectl_annotations(desired.metadata.get_or_insert_with(Default::default), live);
    }
}

/// Drives create-or-update against a store, retrying on write conflicts.
///
/// Cheap to clone; clones share the cancellation token.
#[derive(Debug, Clone)]
pub struct Reconciler {
    pub(crate) retry: RetryPolicy,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cancel: CancellationToken,
}

impl Default for Reconciler {
    fn default() -> Self { Self::new() }
}

impl Reconciler {
    pub fn new() -> Self {
        Self { retry: RetryPolicy::default(), clock: Arc::new(TokioClock), cancel: CancellationToken::new() }
    }

    /// Reconciler with the retry policy taken from the environment.
    pub fn from_env() -> Self { Self::new().with_retry(RetryPolicy::from_env()) }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cancelling `token` interrupts any backoff wait in progress.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy { &self.retry }

    pub fn cancellation(&self) -> &CancellationToken { &self.cancel }

    /// Create `desired` if it does not exist, otherwise merge it over the live
    /// object and update. Only write conflicts are retried.
    pub async fn create_or_update<K, A>(&self, api: &A, desired: &K) -> Result<K>
    where
        K: Converge,
        A: ObjectApi<K> + ?Sized,
    {
        self.upsert(api, desired, &AtomicBool::new(false)).await
    }

    /// [`Self::create_or_update`]; `replaced` tells whether the last attempt
    /// got as far as updating the live object.
    pub(crate) async fn upsert<K, A>(&self, api: &A, desired: &K, replaced: &AtomicBool) -> Result<K>
    where
        K: Converge,
        A: ObjectApi<K> + ?Sized,
    {
        let kind = K::kind(&()).into_owned();
        let name = desired.meta().name.clone().unwrap_or_default();
        if name.is_empty() && !K::CREATE_WHEN_UNNAMED {
            return Err(Error::Precondition(format!("{} has no metadata.name", kind)));
        }
        let (kind, name) = (kind.as_str(), name.as_str());
        retry::on_conflict(&self.retry, &self.clock, &self.cancel, move |attempt| async move {
            replaced.store(false, Ordering::Relaxed);
            if name.is_empty() {
                return create(api, desired, kind).await;
            }
            let observed = match api.get(name).await {
                Ok(o) => o,
                Err(e) if is_not_found(&e) => return create(api, desired, kind).await,
                Err(e) => return Err(e.into()),
            };
            let next = merged(desired, &observed);
            if K::SKIP_UNCHANGED && semantically_equal(&observed, &next)? {
                debug!(kind, name, "unchanged; skipping update");
                metrics::counter!("reconcile_skip_total", 1u64, "kind" => kind.to_string());
                return Ok(observed);
            }
            debug!(kind, name, attempt, "updating");
            replaced.store(true, Ordering::Relaxed);
            let updated = api.replace(name, &next).await?;
            metrics::counter!("reconcile_update_total", 1u64, "kind" => kind.to_string());
            Ok(updated)
        })
        .await
    }

    /// Create `desired`; when it already exists only its labels are patched
    /// onto the live object.
    pub async fn create_or_patch_labels<K, A>(&self, api: &A, desired: &K) -> Result<K>
    where
        K: Converge,
        A: ObjectApi<K> + ?Sized,
    {
        let kind = K::kind(&()).into_owned();
        let name = desired.meta().name.as_deref().filter(|n| !n.is_empty());
        let name = name.ok_or_else(|| Error::Precondition(format!("{} has no metadata.name", kind)))?;
        match api.create(desired).await {
            Ok(created) => {
                info!(kind = %kind, name, "created");
                metrics::counter!("reconcile_create_total", 1u64, "kind" => kind.clone());
                Ok(created)
            }
            Err(e) if is_already_exists(&e) => {
                debug!(kind = %kind, name, "exists; patching labels");
                let labels = desired.meta().labels.clone().unwrap_or_default();
                Ok(api.patch_labels(name, &labels, FIELD_MANAGER).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn create<K, A>(api: &A, desired: &K, kind: &str) -> Result<K>
where
    K: Converge,
    A: ObjectApi<K> + ?Sized,
{
    let created = api.create(desired).await?;
    info!(kind, name = created.meta().name.as_deref().unwrap_or_default(), "created");
    metrics::counter!("reconcile_create_total", 1u64, "kind" => kind.to_string());
    Ok(created)
}

/// `desired` with the live object's immutable fields, owners, labels,
/// annotations and version token folded in.
fn merged<K: Converge>(desired: &K, observed: &K) -> K {
    let mut next = desired.clone();
    next.carry_immutable_fields(observed);
    let owners = merge_owner_references(
        observed.meta().owner_references.as_deref().unwrap_or_default(),
        next.meta().owner_references.as_deref().unwrap_or_default(),
    );
    next.meta_mut().owner_references = (!owners.is_empty()).then_some(owners);
    merge_metadata(next.meta_mut(), observed.meta());
    next.carry_template_annotations(observed);
    next
}

const SERVER_METADATA: &[&str] = &["managedFields", "uid", "creationTimestamp", "generation", "selfLink"];

/// Equality on the JSON form, ignoring status, server-populated metadata,
/// nulls and empty collections.
pub fn semantically_equal<T: Serialize>(a: &T, b: &T) -> Result<bool> {
    Ok(normalized(a)? == normalized(b)?)
}

fn normalized<T: Serialize>(obj: &T) -> Result<Value> {
    let mut v = serde_json::to_value(obj)?;
    if let Some(map) = v.as_object_mut() {
        map.remove("status");
        if let Some(meta) = map.get_mut("metadata").and_then(Value::as_object_mut) {
            for k in SERVER_METADATA {
                meta.remove(*k);
            }
        }
    }
    prune(&mut v);
    Ok(v)
}

fn prune(v: &mut Value) {
    match v {
        Value::Object(map) => {
            for child in map.values_mut() {
                prune(child);
            }
            map.retain(|_, c| !is_empty(c));
        }
        Value::Array(items) => items.iter_mut().for_each(prune),
        _ => {}
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}
