//! kaas-conformance - cluster hardening and robustness checks for Kubernetes
//!
//! Runs as a test plugin inside the cluster under test (e.g. as a Sonobuoy
//! plugin) and inspects live cluster state: node network exposure, kubelet
//! configuration, kube-apiserver flags, etcd TLS posture and namespace Pod
//! Security enforcement. Robustness checks cover request limits, flow
//! control, etcd maintenance, certificate lifetime and the registry standard.
//!
//! # Modules
//!
//! - [`harvest`] - Fetch node endpoints through the API server node proxy
//! - [`kubelet`] - Parse harvested kubelet `configz` snapshots
//! - [`probe`] - TCP and TLS reachability probes
//! - [`checks`] - The built-in checks
//! - [`suite`] - Check runner, reports and progress
//! - [`config`] - Run settings

#![deny(missing_docs)]

pub mod checks;
pub mod config;
pub mod harvest;
pub mod kubelet;
pub mod probe;
pub mod suite;

pub use kaas_common::{Error, Result};

/// Name the suite reports under
pub const SUITE_NAME: &str = "scs cluster hardening";
