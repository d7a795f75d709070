//! RBAC capability checks via SelfSubjectAccessReview.

use std::fmt;

use k8s_openapi::api::authorization::v1::ResourceAttributes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::AccessReviewer;

/// Namespace value meaning "every namespace".
pub const ALL_NAMESPACES: &str = "";

/// A resource and the verbs the operator needs on it. An empty `name`
/// means every object of the resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAttribute {
    pub resource: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub verbs: Vec<String>,
}

impl ResourceAttribute {
    pub fn new(group: &str, resource: &str, verbs: &[&str]) -> Self {
        Self {
            resource: resource.to_string(),
            group: group.to_string(),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

/// One denied (namespace, resource, verb) combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingPermission {
    pub verb: String,
    pub resource: String,
    pub name: String,
    pub group: String,
    pub namespace: String,
}

impl fmt::Display for MissingPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resource =
            if self.name.is_empty() { self.resource.clone() } else { format!("{}/{}", self.resource, self.name) };
        write!(f, "missing {:?} permission on resource {:?} (group: {:?}) for ", self.verb, resource, self.group)?;
        if self.namespace == ALL_NAMESPACES {
            f.write_str("all namespaces")
        } else {
            write!(f, "namespace {:?}", self.namespace)
        }
    }
}

impl std::error::Error for MissingPermission {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccessReport {
    pub allowed: bool,
    pub missing: Vec<MissingPermission>,
}

/// Check every verb of every attribute in every namespace, sequentially.
///
/// Denials are collected; the first transport or API error aborts the whole
/// check. No namespaces means [`ALL_NAMESPACES`].
pub async fn is_allowed<R>(reviewer: &R, namespaces: &[String], attributes: &[ResourceAttribute]) -> Result<AccessReport>
where
    R: AccessReviewer + ?Sized,
{
    if attributes.is_empty() {
        return Err(Error::Precondition("resource attributes must not be empty".into()));
    }
    let all = [ALL_NAMESPACES.to_string()];
    let namespaces = if namespaces.is_empty() { &all[..] } else { namespaces };

    let mut missing = Vec::new();
    for ns in namespaces {
        for ra in attributes {
            for verb in &ra.verbs {
                let attrs = review_attributes(ns, ra, verb);
                if reviewer.review(attrs).await? {
                    continue;
                }
                let denied = MissingPermission {
                    verb: verb.clone(),
                    resource: ra.resource.clone(),
                    name: ra.name.clone(),
                    group: ra.group.clone(),
                    namespace: ns.clone(),
                };
                debug!(%denied, "access denied");
                metrics::counter!("access_denied_total", 1u64);
                missing.push(denied);
            }
        }
    }
    if !missing.is_empty() {
        warn!(count = missing.len(), "missing permissions");
    }
    Ok(AccessReport { allowed: missing.is_empty(), missing })
}

fn review_attributes(ns: &str, ra: &ResourceAttribute, verb: &str) -> ResourceAttributes {
    let mut namespace = ns.to_string();
    // a review on a single namespace object is evaluated in that namespace
    if ra.group.is_empty() && ra.resource == "namespaces" && !ra.name.is_empty() && namespace.is_empty() {
        namespace = ra.name.clone();
    }
    ResourceAttributes {
        verb: Some(verb.to_string()),
        group: non_empty(&ra.group),
        version: non_empty(&ra.version),
        resource: Some(ra.resource.clone()),
        name: non_empty(&ra.name),
        namespace: non_empty(&namespace),
        ..Default::default()
    }
}

fn non_empty(s: &str) -> Option<String> { (!s.is_empty()).then(|| s.to_string()) }
