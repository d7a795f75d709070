//! Seams between the reconcile operations and the API server.
//!
//! Every operation takes these traits rather than a concrete client so the
//! protocol can be driven against an in-memory store in tests.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use converge_core::JsonPatch;
use k8s_openapi::api::authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

/// Typed access to one namespaced (or cluster-scoped) collection.
#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    async fn get(&self, name: &str) -> Result<K, kube::Error>;

    async fn create(&self, obj: &K) -> Result<K, kube::Error>;

    /// Full update; rejected with 409 Conflict when `obj` carries a stale
    /// resourceVersion.
    async fn replace(&self, name: &str, obj: &K) -> Result<K, kube::Error>;

    async fn patch_json(&self, name: &str, patch: &JsonPatch) -> Result<K, kube::Error>;

    /// Strategic-merge patch of `metadata.labels`.
    async fn patch_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        field_manager: &str,
    ) -> Result<K, kube::Error>;

    async fn delete(&self, name: &str, propagation: PropagationPolicy) -> Result<(), kube::Error>;
}

#[async_trait]
impl<K> ObjectApi<K> for Api<K>
where
    K: kube::Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, kube::Error> { Api::get(self, name).await }

    async fn create(&self, obj: &K) -> Result<K, kube::Error> { Api::create(self, &PostParams::default(), obj).await }

    async fn replace(&self, name: &str, obj: &K) -> Result<K, kube::Error> {
        Api::replace(self, name, &PostParams::default(), obj).await
    }

    async fn patch_json(&self, name: &str, patch: &JsonPatch) -> Result<K, kube::Error> {
        let value = serde_json::to_value(patch).map_err(kube::Error::SerdeError)?;
        let patch: json_patch::Patch = serde_json::from_value(value).map_err(kube::Error::SerdeError)?;
        Api::patch(self, name, &PatchParams::default(), &Patch::<()>::Json(patch)).await
    }

    async fn patch_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        field_manager: &str,
    ) -> Result<K, kube::Error> {
        let pp = PatchParams { field_manager: Some(field_manager.to_string()), ..Default::default() };
        let body = json!({ "metadata": { "labels": labels } });
        Api::patch(self, name, &pp, &Patch::Strategic(body)).await
    }

    async fn delete(&self, name: &str, propagation: PropagationPolicy) -> Result<(), kube::Error> {
        let dp = DeleteParams { propagation_policy: Some(propagation), ..Default::default() };
        Api::delete(self, name, &dp).await.map(|_| ())
    }
}

/// Answers "may the current identity do this?" for one attribute set.
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn review(&self, attributes: ResourceAttributes) -> Result<bool, kube::Error>;
}

#[async_trait]
impl AccessReviewer for Api<SelfSubjectAccessReview> {
    async fn review(&self, attributes: ResourceAttributes) -> Result<bool, kube::Error> {
        let ssar = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec { resource_attributes: Some(attributes), ..Default::default() },
            ..Default::default()
        };
        let res = Api::create(self, &PostParams::default(), &ssar).await?;
        Ok(res.status.map(|s| s.allowed).unwrap_or(false))
    }
}
