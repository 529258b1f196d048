//! Runtime configuration shared by every check

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use kaas_common::kube_utils::ClientSource;
use kaas_common::{Error, DEFAULT_RESULTS_DIR};

use crate::harvest::DEFAULT_PROXY_TIMEOUT;
use crate::probe::DEFAULT_PROBE_TIMEOUT;

/// Concurrent requests the API server is assumed to admit per node
pub const REQUESTS_INFLIGHT_PER_NODE: usize = 250;

/// Concurrent mutating requests the API server is assumed to admit per node
pub const MUTATING_REQUESTS_INFLIGHT_PER_NODE: usize = 50;

/// Default for the API server's `--min-request-timeout` expectation
pub const DEFAULT_MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// How the plugin reaches its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevelopmentMode {
    /// Running inside the cluster under test
    #[default]
    InCluster,
    /// Running on a workstation against an existing cluster
    UseCluster,
}

impl FromStr for DevelopmentMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "incluster" | "in-cluster" => Ok(DevelopmentMode::InCluster),
            "usecluster" => Ok(DevelopmentMode::UseCluster),
            "createcluster" => Err(Error::validation_for_field(
                "development-mode",
                "createcluster is not supported; create the cluster first and use usecluster",
            )),
            other => Err(Error::validation_for_field(
                "development-mode",
                format!("unknown development mode '{other}'"),
            )),
        }
    }
}

impl DevelopmentMode {
    /// Where to load the client configuration from
    ///
    /// An explicit kubeconfig always wins over the mode.
    pub fn client_source(self, kubeconfig: Option<PathBuf>) -> ClientSource {
        match (kubeconfig, self) {
            (Some(path), _) => ClientSource::Kubeconfig(path),
            (None, DevelopmentMode::InCluster) => ClientSource::InCluster,
            (None, DevelopmentMode::UseCluster) => ClientSource::Infer,
        }
    }
}

/// Settings for one suite run
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    /// Directory harvested data and the report are written to
    pub results_dir: PathBuf,
    /// Deadline for each port probe
    pub connect_timeout: Duration,
    /// Deadline for each node proxy request
    pub proxy_timeout: Duration,
    /// Override for the API server's in-flight request limit
    pub max_requests_inflight: Option<usize>,
    /// Override for the API server's in-flight mutating request limit
    pub max_mutating_requests_inflight: Option<usize>,
    /// Shortest time a slow list request is expected to be allowed to run
    pub min_request_timeout: Duration,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            connect_timeout: DEFAULT_PROBE_TIMEOUT,
            proxy_timeout: DEFAULT_PROXY_TIMEOUT,
            max_requests_inflight: None,
            max_mutating_requests_inflight: None,
            min_request_timeout: DEFAULT_MIN_REQUEST_TIMEOUT,
        }
    }
}

impl SuiteConfig {
    /// Check that the settings can drive a run
    pub fn validate(&self) -> Result<(), Error> {
        if self.connect_timeout.is_zero() {
            return Err(Error::validation_for_field(
                "connect-timeout-secs",
                "connect timeout must be greater than zero",
            ));
        }
        if self.proxy_timeout.is_zero() {
            return Err(Error::validation_for_field(
                "proxy-timeout-secs",
                "proxy timeout must be greater than zero",
            ));
        }
        if self.max_requests_inflight == Some(0) {
            return Err(Error::validation_for_field(
                "max-requests-inflight",
                "max requests inflight must be greater than zero",
            ));
        }
        if self.max_mutating_requests_inflight == Some(0) {
            return Err(Error::validation_for_field(
                "max-mutating-requests-inflight",
                "max mutating requests inflight must be greater than zero",
            ));
        }
        Ok(())
    }

    /// In-flight limit to test against, given the cluster's node count
    pub fn requests_inflight_limit(&self, node_count: usize) -> usize {
        self.max_requests_inflight
            .unwrap_or(node_count.max(1) * REQUESTS_INFLIGHT_PER_NODE)
    }

    /// Mutating in-flight limit to test against, given the node count
    pub fn mutating_requests_inflight_limit(&self, node_count: usize) -> usize {
        self.max_mutating_requests_inflight
            .unwrap_or(node_count.max(1) * MUTATING_REQUESTS_INFLIGHT_PER_NODE)
    }
}

/// Identifier attached to every log line of one run
pub fn generate_run_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    if prefix.is_empty() {
        format!("kaas-{suffix}")
    } else {
        format!("{prefix}-{suffix}")
    }
}
