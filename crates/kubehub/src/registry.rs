//! Immutable mapping from Rust resource types to their group/version/kind.
//!
//! Built once at process start and handed by reference to whatever needs
//! kind resolution; there is no global registry.

use std::any::TypeId;
use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use kube::Resource;
use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("type {0} is not registered")]
    Unregistered(&'static str),
    #[error("missing apiVersion or kind and cannot assign it: {0}")]
    Convert(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredKind {
    pub gvk: GroupVersionKind,
    pub plural: String,
    pub namespaced: bool,
}

impl RegisteredKind {
    pub fn api_version(&self) -> String {
        if self.gvk.group.is_empty() {
            self.gvk.version.clone()
        } else {
            format!("{}/{}", self.gvk.group, self.gvk.version)
        }
    }

    pub fn type_meta(&self) -> TypeMeta {
        TypeMeta { api_version: self.api_version(), kind: self.gvk.kind.clone() }
    }

    pub fn api_resource(&self) -> ApiResource { ApiResource::from_gvk_with_plural(&self.gvk, &self.plural) }
}

#[derive(Debug, Default)]
pub struct KindRegistryBuilder {
    by_type: FxHashMap<TypeId, RegisteredKind>,
}

impl KindRegistryBuilder {
    pub fn register<K>(mut self) -> Self
    where
        K: Resource<DynamicType = ()> + 'static,
        K::Scope: 'static,
    {
        let kind = RegisteredKind {
            gvk: GroupVersionKind {
                group: K::group(&()).into_owned(),
                version: K::version(&()).into_owned(),
                kind: K::kind(&()).into_owned(),
            },
            plural: K::plural(&()).into_owned(),
            namespaced: TypeId::of::<K::Scope>() == TypeId::of::<k8s_openapi::NamespaceResourceScope>(),
        };
        self.by_type.insert(TypeId::of::<K>(), kind);
        self
    }

    pub fn build(self) -> KindRegistry {
        let by_gvk = self
            .by_type
            .values()
            .map(|k| ((k.gvk.group.clone(), k.gvk.version.clone(), k.gvk.kind.clone()), k.clone()))
            .collect();
        KindRegistry { by_type: self.by_type, by_gvk }
    }
}

#[derive(Debug, Default)]
pub struct KindRegistry {
    by_type: FxHashMap<TypeId, RegisteredKind>,
    by_gvk: BTreeMap<(String, String, String), RegisteredKind>,
}

impl KindRegistry {
    pub fn builder() -> KindRegistryBuilder { KindRegistryBuilder::default() }

    /// Registry covering every kind the reconcile operations manage.
    pub fn builtin() -> Self {
        Self::builder()
            .register::<Service>()
            .register::<Endpoints>()
            .register::<EndpointSlice>()
            .register::<Secret>()
            .register::<ConfigMap>()
            .register::<DaemonSet>()
            .register::<StatefulSet>()
            .register::<Pod>()
            .build()
    }

    pub fn len(&self) -> usize { self.by_type.len() }

    pub fn is_empty(&self) -> bool { self.by_type.is_empty() }

    pub fn kind_for<K: 'static>(&self) -> Option<&RegisteredKind> { self.by_type.get(&TypeId::of::<K>()) }

    pub fn type_meta_for<K: 'static>(&self) -> Result<TypeMeta, RegistryError> {
        self.kind_for::<K>()
            .map(RegisteredKind::type_meta)
            .ok_or(RegistryError::Unregistered(std::any::type_name::<K>()))
    }

    pub fn resolve(&self, gvk: &GroupVersionKind) -> Option<&RegisteredKind> {
        self.by_gvk.get(&(gvk.group.clone(), gvk.version.clone(), gvk.kind.clone()))
    }

    /// Convert a typed object into a [`DynamicObject`] carrying its type metadata.
    pub fn to_dynamic<K: Serialize + 'static>(&self, obj: &K) -> Result<DynamicObject, RegistryError> {
        let tm = self.type_meta_for::<K>()?;
        let mut raw = serde_json::to_value(obj)?;
        if let Some(map) = raw.as_object_mut() {
            map.insert("apiVersion".into(), tm.api_version.into());
            map.insert("kind".into(), tm.kind.into());
        }
        Ok(serde_json::from_value(raw)?)
    }
}
