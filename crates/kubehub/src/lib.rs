//! Converge kubehub: cluster configuration, kind resolution and discovery probes.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use http::header::USER_AGENT as USER_AGENT_HEADER;
use http::HeaderValue;
use kube::{
    client::ClientBuilder,
    config::{KubeConfigOptions, Kubeconfig},
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
    Client, Config,
};
use serde::{Deserialize, Serialize};
use tower::limit::RateLimitLayer;
use tower_http::set_header::SetRequestHeaderLayer;
use tracing::{debug, info};

pub mod registry;

pub use registry::{KindRegistry, KindRegistryBuilder, RegisteredKind, RegistryError};

/// Environment variable naming an optional kubeconfig file.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// User-agent sent with every request, replacing whatever the stack set.
pub const USER_AGENT: &str = concat!("converge/", env!("CARGO_PKG_VERSION"));

/// Client-side request budget: at most this many requests per second, which
/// may be spent in a single burst.
pub const REQUESTS_PER_SECOND: u64 = 100;

/// Layer stamping [`USER_AGENT`] on outgoing requests.
pub fn user_agent_layer() -> SetRequestHeaderLayer<HeaderValue> {
    SetRequestHeaderLayer::overriding(USER_AGENT_HEADER, HeaderValue::from_static(USER_AGENT))
}

/// Layer holding requests back once [`REQUESTS_PER_SECOND`] is used up.
pub fn rate_limit_layer() -> RateLimitLayer { RateLimitLayer::new(REQUESTS_PER_SECOND, Duration::from_secs(1)) }

/// How to reach the cluster. An empty config means "kubeconfig from
/// `KUBECONFIG` if set, otherwise in-cluster service account".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// API server URL, used when no kubeconfig is configured.
    pub host: Option<String>,
    pub kubeconfig_path: Option<PathBuf>,
    /// Impersonate this user for every request.
    pub as_user: Option<String>,
    /// Skip TLS verification when talking to `host`.
    pub accept_invalid_certs: bool,
}

impl ClusterConfig {
    fn effective_kubeconfig(&self) -> Option<PathBuf> {
        self.kubeconfig_path
            .clone()
            .or_else(|| std::env::var_os(KUBECONFIG_ENV).filter(|v| !v.is_empty()).map(PathBuf::from))
    }

    /// Resolve into a kube client configuration.
    pub async fn to_kube_config(&self) -> Result<Config> {
        let mut cfg = if let Some(path) = self.effective_kubeconfig() {
            let kc = Kubeconfig::read_from(&path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("error creating config from {}", path.display()))?
        } else {
            match self.host.as_deref().filter(|h| !h.is_empty()) {
                None => Config::incluster().context("loading in-cluster config")?,
                Some(host) => {
                    let url = match host.parse() {
                        Ok(url) => url,
                        Err(e) => return Err(anyhow!("error parsing host url {}: {}", host, e)),
                    };
                    let mut cfg = Config::new(url);
                    if host.starts_with("https://") {
                        cfg.accept_invalid_certs = self.accept_invalid_certs;
                    }
                    cfg
                }
            }
        };
        if let Some(user) = self.as_user.as_deref().filter(|u| !u.is_empty()) {
            cfg.auth_info.impersonate = Some(user.to_string());
        }
        debug!(url = %cfg.cluster_url, impersonate = ?self.as_user, "cluster config resolved");
        Ok(cfg)
    }

    /// Client with the user-agent and rate limit applied to every request.
    pub async fn client(&self) -> Result<Client> {
        let cfg = self.to_kube_config().await?;
        let builder = ClientBuilder::try_from(cfg).context("building kube client")?;
        Ok(builder.with_layer(&rate_limit_layer()).with_layer(&user_agent_layer()).build())
    }
}

/// Whether `resource` (plural name) is served under `group_version`, e.g.
/// `("monitoring.coreos.com/v1", "prometheuses")` or `("v1", "services")`.
///
/// Every call asks the API server; nothing is cached.
pub async fn is_resource_supported(client: &Client, group_version: &str, resource: &str) -> Result<bool> {
    let res = if group_version.contains('/') {
        client.list_api_group_resources(group_version).await
    } else {
        client.list_core_api_resources(group_version).await
    };
    match res {
        Ok(list) => Ok(list.resources.iter().any(|r| r.name == resource)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(gv = %group_version, "group version not served");
            Ok(false)
        }
        Err(e) => Err(e).with_context(|| format!("listing resources for {}", group_version)),
    }
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK with the registry first, falling back to live discovery for
/// kinds the process did not register (CRDs owned by other operators).
pub async fn find_api_resource(
    client: Client,
    registry: &KindRegistry,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool)> {
    if let Some(k) = registry.resolve(gvk) {
        return Ok((k.api_resource(), k.namespaced));
    }
    info!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "kind not registered; running discovery");
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}
