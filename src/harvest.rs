//! Node-data harvesting through the API server's node proxy
//!
//! For every node the harvester fetches a non-resource endpoint (usually
//! `configz`) via `/api/v1/nodes/<node>/proxy/<endpoint>` and persists the raw
//! body to `<results_dir>/<node>/<endpoint>.json` for later evaluation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use kube::client::Body;
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use kaas_common::fanout::fan_out_try;
use kaas_common::Error;

/// Default absolute deadline for one proxied request
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait abstracting the proxied GET of a node endpoint
///
/// Production code goes through the API server; tests substitute a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeProxy: Send + Sync {
    /// Fetch `endpoint` from `node` and return the raw response body
    async fn get(&self, node: &str, endpoint: &str) -> Result<Vec<u8>, Error>;
}

/// [`NodeProxy`] backed by the API server node proxy subresource
pub struct KubeNodeProxy {
    client: Client,
    timeout: Duration,
}

impl KubeNodeProxy {
    /// Create a proxy that bounds every request by `timeout`
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl NodeProxy for KubeNodeProxy {
    async fn get(&self, node: &str, endpoint: &str) -> Result<Vec<u8>, Error> {
        let path = format!("/api/v1/nodes/{node}/proxy/{endpoint}");
        let request = http::Request::get(&path)
            .body(Body::from(Vec::new()))
            .map_err(|e| Error::harvest_for(node, endpoint, format!("invalid request: {e}")))?;

        debug!(node, endpoint, "Requesting node endpoint");
        let fetch = async {
            let response = self.client.send(request).await?;
            let status = response.status();
            let body = response.into_body().collect_bytes().await?;
            Ok::<_, kube::Error>((status, body.to_vec()))
        };
        let (status, body) = tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| {
                Error::harvest_for(
                    node,
                    endpoint,
                    format!("timed out after {}s", self.timeout.as_secs()),
                )
            })?
            .map_err(|e| Error::harvest_for(node, endpoint, e.to_string()))?;

        proxied_body(node, endpoint, status, body)
    }
}

/// Raw body of a proxied response, or an error for a non-success status
///
/// The body is returned byte for byte; it is never decoded.
fn proxied_body(
    node: &str,
    endpoint: &str,
    status: StatusCode,
    body: Vec<u8>,
) -> Result<Vec<u8>, Error> {
    if status.is_success() {
        return Ok(body);
    }
    Err(Error::harvest_for(
        node,
        endpoint,
        format!("{status}: {}", String::from_utf8_lossy(&body).trim()),
    ))
}

/// A node endpoint response persisted to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestedFile {
    /// Node the data came from
    pub node: String,
    /// Where the raw body was written
    pub path: PathBuf,
}

/// Outcome of a harvest over several nodes
#[derive(Debug, Default)]
pub struct HarvestReport {
    /// Files written, in node order
    pub files: Vec<HarvestedFile>,
    /// Nodes whose fetch or write failed, in node order
    pub failures: Vec<(String, Error)>,
}

impl HarvestReport {
    /// Whether every node was harvested
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Written files, or the first failing node's error
    pub fn into_files(self) -> Result<Vec<HarvestedFile>, Error> {
        match self.failures.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(self.files),
        }
    }
}

/// Path a node's endpoint response is persisted at
pub fn node_file_path(results_dir: &Path, node: &str, endpoint: &str) -> PathBuf {
    results_dir.join(node).join(format!("{endpoint}.json"))
}

/// Reject names that would escape the results directory
fn validate_path_segment(field: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') {
        return Err(Error::validation_for_field(
            field,
            format!("{field} '{value}' cannot be used as a path segment"),
        ));
    }
    Ok(())
}

/// Fetch `endpoint` from every node and persist the responses.
///
/// All node directories are created before any request is issued; failing to
/// create one aborts the harvest. Requests then run concurrently, one task
/// per node, and a failed node does not stop the others from being written.
pub async fn harvest_node_data(
    proxy: Arc<dyn NodeProxy>,
    nodes: &[String],
    endpoint: &str,
    results_dir: &Path,
) -> Result<HarvestReport, Error> {
    validate_path_segment("endpoint", endpoint)?;
    for node in nodes {
        validate_path_segment("node", node)?;
    }

    for node in nodes {
        let dir = results_dir.join(node);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(dir.display().to_string(), e.to_string()))?;
    }

    info!(nodes = nodes.len(), endpoint, "Harvesting node data");

    let endpoint_owned = endpoint.to_string();
    let results_dir_owned = results_dir.to_path_buf();
    let results = fan_out_try(nodes.to_vec(), move |node| {
        let proxy = proxy.clone();
        let endpoint = endpoint_owned.clone();
        let path = node_file_path(&results_dir_owned, &node, &endpoint);
        async move {
            let body = proxy.get(&node, &endpoint).await?;
            tokio::fs::write(&path, &body)
                .await
                .map_err(|e| Error::io(path.display().to_string(), e.to_string()))?;
            debug!(node = %node, path = %path.display(), bytes = body.len(), "Persisted node data");
            Ok::<_, Error>(path)
        }
    })
    .await;

    let mut report = HarvestReport::default();
    for (node, result) in results {
        match result {
            Ok(path) => report.files.push(HarvestedFile { node, path }),
            Err(e) => {
                warn!(
                    node = %e.node().unwrap_or(&node),
                    endpoint,
                    error = %e,
                    "Failed to harvest node data"
                );
                report.failures.push((node, e));
            }
        }
    }

    Ok(report)
}
