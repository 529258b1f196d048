//! Built-in cluster hardening and robustness checks
//!
//! Every check pairs a thin async `run` that fetches cluster state with a
//! pure `evaluate` function that turns the fetched objects into findings.

pub mod apiserver;
pub mod certificates;
pub mod etcd;
pub mod flags;
pub mod flow_control;
pub mod kubelet;
pub mod pod_security;
pub mod ports;
pub mod registry;
pub mod request_limits;

use std::collections::HashSet;
use std::fmt;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use kaas_common::kube_utils::display_name;
use kaas_common::Error;

use crate::suite::{Check, CheckReport};

/// Every built-in check in execution order
pub fn all() -> Vec<Box<dyn Check>> {
    vec![
        Box::new(kubelet::KubeletConfigCheck::read_only_port()),
        Box::new(ports::ControlPlanePorts),
        Box::new(ports::EndpointsHttps),
        Box::new(kubelet::KubeletConfigCheck::anonymous_auth()),
        Box::new(kubelet::KubeletConfigCheck::webhook_authorization()),
        Box::new(apiserver::ApiServerFlagCheck::node_restriction()),
        Box::new(pod_security::PodSecurity),
        Box::new(apiserver::ApiServerFlagCheck::authorization_modes()),
        Box::new(apiserver::ApiServerFlagCheck::authentication_methods()),
        Box::new(apiserver::ApiServerFlagCheck::etcd_tls()),
        Box::new(apiserver::ApiServerFlagCheck::etcd_isolation()),
        Box::new(request_limits::MaxRequestsInflight),
        Box::new(request_limits::MaxMutatingRequestsInflight),
        Box::new(request_limits::MinRequestTimeout),
        Box::new(flow_control::EventRateLimit),
        Box::new(flow_control::ApiPriorityAndFairness),
        Box::new(flow_control::RateLimitValues),
        Box::new(etcd::EtcdCompaction),
        Box::new(etcd::EtcdBackup),
        Box::new(certificates::CertificateRotation),
        Box::new(registry::RegistryStandard),
    ]
}

/// Restrict `checks` to the `only` list (when non-empty) minus `skip`.
///
/// Unknown names in either list are rejected so a typo never silently
/// turns into "run nothing" or "skip nothing".
pub fn select(
    checks: Vec<Box<dyn Check>>,
    only: &[String],
    skip: &[String],
) -> Result<Vec<Box<dyn Check>>, Error> {
    let known: HashSet<&str> = checks.iter().map(|c| c.name()).collect();
    for (flag, names) in [("check", only), ("skip", skip)] {
        if let Some(unknown) = names.iter().find(|n| !known.contains(n.as_str())) {
            return Err(Error::validation_for_field(
                flag,
                format!("unknown check '{unknown}'"),
            ));
        }
    }

    Ok(checks
        .into_iter()
        .filter(|c| only.is_empty() || only.iter().any(|n| n == c.name()))
        .filter(|c| !skip.iter().any(|n| n == c.name()))
        .collect())
}

/// Record a skip warning and return true on kind clusters
///
/// Several robustness settings are not configured on kind and are only
/// required of production clusters.
pub(crate) fn skip_on_kind(kind: bool, report: &mut CheckReport) -> bool {
    if kind {
        report.warn("skipped on kind cluster: only required for production clusters");
    }
    kind
}

/// Kind, namespace and name of a cluster object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedObject {
    /// Object kind, e.g. `Deployment`
    pub kind: String,
    /// Namespace, empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl NamedObject {
    /// Build from an object's kind and metadata
    pub fn new(kind: impl Into<String>, meta: &ObjectMeta) -> Self {
        Self {
            kind: kind.into(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: display_name(meta).to_string(),
        }
    }
}

impl fmt::Display for NamedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// List every object of type `K` across all namespaces by name
pub(crate) async fn list_named<K>(client: &Client) -> Result<Vec<NamedObject>, Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug,
{
    let api: Api<K> = Api::all(client.clone());
    let kind = K::kind(&());
    Ok(api
        .list(&ListParams::default())
        .await?
        .items
        .iter()
        .map(|obj| NamedObject::new(kind.as_ref(), obj.meta()))
        .collect())
}

/// Value stored under `key` in the ConfigMap called `name`
pub(crate) fn config_map_value<'a>(
    config_maps: &'a [ConfigMap],
    name: &str,
    key: &str,
) -> Option<&'a str> {
    config_maps
        .iter()
        .find(|cm| cm.name_any() == name)
        .and_then(|cm| cm.data.as_ref())
        .and_then(|data| data.get(key))
        .map(String::as_str)
}
