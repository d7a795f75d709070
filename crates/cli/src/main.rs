use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use converge_core::{pod_running_and_ready, ResourceNamer, STATUS_CLEANUP_FINALIZER};
use converge_kubehub::{find_api_resource, is_resource_supported, parse_gvk_key, ClusterConfig, KindRegistry};
use converge_ops::{
    ensure_custom_governing_service, ensure_finalizer, is_allowed, remove_finalizer, Converge, ForceUpdate, Reconciler,
    ResourceAttribute,
};
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::authorization::v1::SelfSubjectAccessReview;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DynamicObject};
use kube::Client;
use serde_json::{json, Value};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "convergectl", version, about = "Drive converge reconcile primitives against a cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Kubeconfig file (falls back to KUBECONFIG, then in-cluster config)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// API server URL when no kubeconfig is used
    #[arg(long = "server", global = true, env = "CONVERGE_SERVER")]
    server: Option<String>,

    /// Impersonate this user
    #[arg(long = "as", global = true)]
    as_user: Option<String>,

    /// Skip TLS verification for --server
    #[arg(long = "insecure-skip-tls-verify", global = true, action = ArgAction::SetTrue)]
    insecure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum FinalizerAction { Add, Remove }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the DNS-1123 label for a name (offline)
    Name {
        name: String,
        /// Prefix prepended with a dash
        #[arg(long = "prefix")]
        prefix: Option<String>,
        /// Append a hash suffix so distinct inputs never collide
        #[arg(long = "unique", action = ArgAction::SetTrue)]
        unique: bool,
    },
    /// Check RBAC permissions of the current identity
    CanI {
        /// Resource plural, e.g. "secrets"
        resource: String,
        /// Verbs to check
        #[arg(long = "verb", required = true, value_delimiter = ',')]
        verbs: Vec<String>,
        #[arg(long = "group", default_value = "")]
        group: String,
        #[arg(long = "api-version", default_value = "")]
        version: String,
        /// Single object name (default: all objects)
        #[arg(long = "name", default_value = "")]
        name: String,
        /// Namespaces to check (default: all namespaces)
        #[arg(long = "namespaces", value_delimiter = ',')]
        namespaces: Vec<String>,
    },
    /// Add or remove a finalizer on an object
    Finalizer {
        #[arg(value_enum)]
        action: FinalizerAction,
        /// GVK key, e.g. "v1/Secret" or "monitoring.coreos.com/v1/Prometheus"
        gvk: String,
        name: String,
        #[arg(long = "finalizer", default_value = STATUS_CLEANUP_FINALIZER)]
        finalizer: String,
    },
    /// Create or update the object described by a YAML or JSON manifest
    Reconcile {
        file: PathBuf,
        /// Delete and let the caller recreate a StatefulSet whose update is rejected
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Check whether a resource is served, e.g. "monitoring.coreos.com/v1 prometheuses"
    Supports { group_version: String, resource: String },
    /// Report whether a pod is running and ready
    Ready { pod: String },
    /// Verify a custom governing service selects the given pod labels
    Governing {
        service: String,
        /// Pod labels as k=v pairs
        #[arg(long = "selector", value_delimiter = ',')]
        selector: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("CONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

impl Cli {
    fn cluster(&self) -> ClusterConfig {
        ClusterConfig {
            host: self.server.clone(),
            kubeconfig_path: self.kubeconfig.clone(),
            as_user: self.as_user.clone(),
            accept_invalid_certs: self.insecure,
        }
    }
}

fn print(output: Output, human: impl FnOnce() -> String, value: Value) -> Result<()> {
    match output {
        Output::Human => println!("{}", human()),
        Output::Json => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(())
}

fn parse_labels(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(anyhow!("invalid label {:?} (expect key=value)", p)),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if let Commands::Name { name, prefix, unique } = &cli.command {
        let namer = prefix.as_deref().map_or_else(ResourceNamer::new, ResourceNamer::with_prefix);
        let label = if *unique { namer.unique_label(name)? } else { namer.label(name)? };
        return print(cli.output, || label.clone(), json!({ "name": name, "label": label }));
    }

    let client = cli.cluster().client().await?;
    let ns = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());

    match &cli.command {
        Commands::Name { .. } => unreachable!("handled before connecting"),
        Commands::CanI { resource, verbs, group, version, name, namespaces } => {
            let attr = ResourceAttribute {
                resource: resource.clone(),
                name: name.clone(),
                group: group.clone(),
                version: version.clone(),
                verbs: verbs.clone(),
            };
            let reviewer: Api<SelfSubjectAccessReview> = Api::all(client);
            let report = is_allowed(&reviewer, namespaces, &[attr]).await?;
            let human = || {
                if report.allowed {
                    "yes".to_string()
                } else {
                    report.missing.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
                }
            };
            print(cli.output, human, serde_json::to_value(&report)?)?;
            if !report.allowed {
                std::process::exit(1);
            }
        }
        Commands::Finalizer { action, gvk, name, finalizer } => {
            let registry = KindRegistry::builtin();
            let gvk = parse_gvk_key(gvk)?;
            let (ar, namespaced) = find_api_resource(client.clone(), &registry, &gvk).await?;
            let api: Api<DynamicObject> =
                if namespaced { Api::namespaced_with(client, &ns, &ar) } else { Api::all_with(client, &ar) };
            info!(kind = %ar.kind, name = %name, finalizer = %finalizer, ?action, "finalizer invoked");
            let patched = match action {
                FinalizerAction::Add => ensure_finalizer::<DynamicObject, _>(&api, name, finalizer).await?,
                FinalizerAction::Remove => remove_finalizer::<DynamicObject, _>(&api, name, finalizer).await?,
            };
            let changed = patched.is_some();
            print(
                cli.output,
                || if changed { format!("{} {} patched", ar.kind, name) } else { format!("{} {} unchanged", ar.kind, name) },
                json!({ "kind": ar.kind, "name": name, "changed": changed }),
            )?;
        }
        Commands::Reconcile { file, force } => {
            let out = reconcile_manifest(client, &ns, file, *force).await?;
            let summary = format!(
                "{} {} reconciled",
                out.get("kind").and_then(Value::as_str).unwrap_or("object"),
                out.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default()
            );
            print(cli.output, || summary, out)?;
        }
        Commands::Supports { group_version, resource } => {
            let supported = is_resource_supported(&client, group_version, resource).await?;
            print(
                cli.output,
                || if supported { "yes".into() } else { "no".into() },
                json!({ "groupVersion": group_version, "resource": resource, "supported": supported }),
            )?;
        }
        Commands::Ready { pod } => {
            let api: Api<Pod> = Api::namespaced(client, &ns);
            let p = api.get(pod).await.with_context(|| format!("getting pod {}/{}", ns, pod))?;
            match pod_running_and_ready(&p) {
                Ok(ready) => print(cli.output, || ready.to_string(), json!({ "pod": pod, "ready": ready }))?,
                Err(e) => {
                    error!(pod = %pod, error = %e, "pod will not become ready");
                    bail!(e);
                }
            }
        }
        Commands::Governing { service, selector } => {
            let labels = parse_labels(selector)?;
            let api: Api<Service> = Api::namespaced(client, &ns);
            ensure_custom_governing_service(&api, &ns, service, &labels).await?;
            print(cli.output, || "ok".into(), json!({ "service": service, "namespace": ns, "selected": true }))?;
        }
    }
    Ok(())
}

async fn reconcile_manifest(client: Client, default_ns: &str, path: &Path, force: bool) -> Result<Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let doc: Value = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
    let ns = doc.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or(default_ns).to_string();
    let rec = Reconciler::from_env();
    info!(kind = %kind, ns = %ns, file = %path.display(), "reconcile invoked");
    match kind.as_str() {
        "Service" => apply::<Service>(&rec, client, &ns, doc).await,
        "Endpoints" => apply::<Endpoints>(&rec, client, &ns, doc).await,
        "EndpointSlice" => apply::<EndpointSlice>(&rec, client, &ns, doc).await,
        "Secret" => apply::<Secret>(&rec, client, &ns, doc).await,
        "ConfigMap" => apply::<ConfigMap>(&rec, client, &ns, doc).await,
        "DaemonSet" => apply::<DaemonSet>(&rec, client, &ns, doc).await,
        "StatefulSet" if force => {
            let desired: StatefulSet = serde_json::from_value(doc)?;
            let api: Api<StatefulSet> = Api::namespaced(client, &ns);
            let on_delete = |reason: &str| warn!(reason, "StatefulSet will be recreated");
            match rec.force_update_stateful_set(&api, &desired, Some(on_delete)).await? {
                ForceUpdate::Updated(sts) => Ok(serde_json::to_value(sts)?),
                ForceUpdate::Deleted => Ok(json!({ "kind": "StatefulSet", "metadata": desired.metadata, "deleted": true })),
            }
        }
        "StatefulSet" => apply::<StatefulSet>(&rec, client, &ns, doc).await,
        "" => bail!("{} has no kind", path.display()),
        other => bail!("unsupported kind {}", other),
    }
}

async fn apply<K>(rec: &Reconciler, client: Client, ns: &str, doc: Value) -> Result<Value>
where
    K: Converge + kube::Resource<Scope = NamespaceResourceScope>,
{
    let desired: K = serde_json::from_value(doc)?;
    let api: Api<K> = Api::namespaced(client, ns);
    let out = rec.create_or_update(&api, &desired).await?;
    let mut value = serde_json::to_value(out)?;
    // typed objects come back without type meta
    if let Some(map) = value.as_object_mut() {
        map.insert("kind".into(), json!(K::kind(&())));
    }
    Ok(value)
}
