//! Common building blocks for kaas-conformance: errors, Kubernetes helpers,
//! task fan-out and telemetry setup.

#![deny(missing_docs)]

pub mod error;
pub mod fanout;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding the control-plane static pods
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Label selector matching kube-apiserver static pods (kubeadm layout)
pub const APISERVER_LABEL_SELECTOR: &str = "component=kube-apiserver";

/// Label selectors tried in order to find etcd static pods
pub const ETCD_LABEL_SELECTORS: [&str; 3] = [
    "component=etcd",
    "k8s-app=etcd",
    "tier=control-plane,component=etcd",
];

/// Label selector matching kube-controller-manager static pods
pub const CONTROLLER_MANAGER_LABEL_SELECTOR: &str = "component=kube-controller-manager";

/// `spec.providerID` prefix of nodes created by kind
pub const KIND_PROVIDER_ID_PREFIX: &str = "kind://";

/// Node role label carried by control-plane nodes
pub const CONTROL_PLANE_ROLE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Default scratch directory a Sonobuoy plugin writes its results into
pub const DEFAULT_RESULTS_DIR: &str = "/tmp/sonobuoy/results";
