//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction and the handful of listings every check relies on.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::{
    Error, APISERVER_LABEL_SELECTOR, CONTROL_PLANE_ROLE_LABEL, ETCD_LABEL_SELECTORS,
    KIND_PROVIDER_ID_PREFIX, KUBE_SYSTEM_NAMESPACE,
};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the client configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSource {
    /// Service account of the pod we run in
    InCluster,
    /// Explicit kubeconfig file
    Kubeconfig(std::path::PathBuf),
    /// kube's inference chain (`KUBECONFIG`, `~/.kube/config`, in-cluster)
    Infer,
}

/// Create a kube client with default timeouts
pub async fn create_client(source: &ClientSource) -> Result<Client, Error> {
    create_client_with_timeout(source, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client with custom timeouts
pub async fn create_client_with_timeout(
    source: &ClientSource,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match source {
        ClientSource::InCluster => Config::incluster()
            .map_err(|e| Error::client(format!("failed to load in-cluster config: {}", e)))?,
        ClientSource::Kubeconfig(path) => load_kubeconfig(path).await?,
        ClientSource::Infer => Config::infer()
            .await
            .map_err(|e| Error::client(format!("failed to infer config: {}", e)))?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    debug!(cluster_url = %config.cluster_url, "Creating kube client");
    Client::try_from(config).map_err(|e| Error::client(format!("failed to create client: {}", e)))
}

async fn load_kubeconfig(path: &Path) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::client(format!(
            "failed to read kubeconfig {}: {}",
            path.display(),
            e
        ))
    })?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::client(format!("failed to load kubeconfig: {}", e)))
}

/// List every node in the cluster
pub async fn list_nodes(client: &Client) -> Result<Vec<Node>, Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    Ok(nodes.list(&ListParams::default()).await?.items)
}

/// List the names of every node in the cluster
pub async fn list_node_names(client: &Client) -> Result<Vec<String>, Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes.list(&ListParams::default()).await?;
    Ok(list
        .items
        .into_iter()
        .filter_map(|node| node.metadata.name)
        .collect())
}

/// List nodes carrying the control-plane role label
pub async fn list_control_plane_nodes(client: &Client) -> Result<Vec<Node>, Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes
        .list(&ListParams::default().labels(CONTROL_PLANE_ROLE_LABEL))
        .await?;
    Ok(list.items)
}

/// List the kube-apiserver static pods in kube-system
pub async fn list_apiserver_pods(client: &Client) -> Result<Vec<Pod>, Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), KUBE_SYSTEM_NAMESPACE);
    let list = pods
        .list(&ListParams::default().labels(APISERVER_LABEL_SELECTOR))
        .await?;
    Ok(list.items)
}

/// List the pods in `namespace` matching a label selector
pub async fn list_pods_by_selector(
    client: &Client,
    namespace: &str,
    selector: &str,
) -> Result<Vec<Pod>, Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    Ok(pods
        .list(&ListParams::default().labels(selector))
        .await?
        .items)
}

/// List the etcd static pods in kube-system
///
/// Tries each of [`ETCD_LABEL_SELECTORS`] and returns the first non-empty
/// match. An empty result usually means etcd runs outside the cluster.
pub async fn list_etcd_pods(client: &Client) -> Result<Vec<Pod>, Error> {
    for selector in ETCD_LABEL_SELECTORS {
        let pods = list_pods_by_selector(client, KUBE_SYSTEM_NAMESPACE, selector).await?;
        if !pods.is_empty() {
            debug!(selector, count = pods.len(), "Found etcd pods");
            return Ok(pods);
        }
    }
    Ok(Vec::new())
}

/// List the ConfigMaps of `namespace`
pub async fn list_config_maps(client: &Client, namespace: &str) -> Result<Vec<ConfigMap>, Error> {
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    Ok(config_maps.list(&ListParams::default()).await?.items)
}

/// Whether `node` was created by kind
pub fn is_kind_node(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_deref())
        .is_some_and(|id| id.starts_with(KIND_PROVIDER_ID_PREFIX))
}

/// Whether the cluster is a kind development cluster
pub fn is_kind_cluster(nodes: &[Node]) -> bool {
    nodes.iter().any(is_kind_node)
}

/// Address used to reach a node from inside the cluster
///
/// Prefers the `InternalIP` address and falls back to the first address
/// the node reports.
pub fn node_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    addresses
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .or_else(|| addresses.first())
        .map(|a| a.address.clone())
}

/// Name of a Kubernetes object, or `"<unnamed>"` for log lines
pub fn display_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or("<unnamed>")
}
