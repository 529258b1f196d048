//! Network exposure of control-plane components

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Node};
use kube::api::{Api, ListParams};
use tracing::debug;

use kaas_common::fanout::fan_out;
use kaas_common::kube_utils::{display_name, list_control_plane_nodes, node_address};
use kaas_common::Error;

use crate::probe::{classify, probe_https, probe_open, Accessibility};
use crate::suite::{Check, CheckContext, CheckReport};

/// kube-apiserver
pub const API_SERVER_PORT: u16 = 6443;
/// kube-controller-manager secure port
pub const CONTROLLER_MANAGER_PORT: u16 = 10257;
/// kube-scheduler secure port
pub const SCHEDULER_PORT: u16 = 10259;
/// Kubelet API
pub const KUBELET_API_PORT: u16 = 10250;
/// etcd client port
pub const ETCD_CLIENT_PORT: u16 = 2379;
/// etcd peer port
pub const ETCD_PEER_PORT: u16 = 2380;

/// Expected reachability of one control-plane port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortExpectation {
    /// Component listening on the port
    pub component: &'static str,
    /// Port number
    pub port: u16,
    /// Whether the port should accept connections
    pub accessible: bool,
}

/// Only the API server may be reachable on a control-plane node
pub const CONTROL_PLANE_PORTS: [PortExpectation; 6] = [
    PortExpectation {
        component: "kube-apiserver",
        port: API_SERVER_PORT,
        accessible: true,
    },
    PortExpectation {
        component: "kube-controller-manager",
        port: CONTROLLER_MANAGER_PORT,
        accessible: false,
    },
    PortExpectation {
        component: "kube-scheduler",
        port: SCHEDULER_PORT,
        accessible: false,
    },
    PortExpectation {
        component: "kubelet",
        port: KUBELET_API_PORT,
        accessible: false,
    },
    PortExpectation {
        component: "etcd",
        port: ETCD_CLIENT_PORT,
        accessible: false,
    },
    PortExpectation {
        component: "etcd",
        port: ETCD_PEER_PORT,
        accessible: false,
    },
];

/// Ports whose endpoints must speak TLS
pub const HTTPS_PORTS: [u16; 6] = [
    API_SERVER_PORT,
    CONTROLLER_MANAGER_PORT,
    SCHEDULER_PORT,
    KUBELET_API_PORT,
    ETCD_CLIENT_PORT,
    ETCD_PEER_PORT,
];

/// One probed `(host, port)` with its expectation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProbe {
    /// Node the host belongs to
    pub node: String,
    /// Address that was dialled
    pub host: String,
    /// What was expected
    pub expectation: PortExpectation,
    /// Whether the connect succeeded
    pub open: bool,
}

/// Control-plane nodes should expose only the API server port
#[derive(Debug, Clone, Copy)]
pub struct ControlPlanePorts;

#[async_trait]
impl Check for ControlPlanePorts {
    fn name(&self) -> &'static str {
        "control-plane-ports"
    }

    fn description(&self) -> &'static str {
        "Control-plane ports other than the API server must not be reachable"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let nodes = list_control_plane_nodes(&ctx.client).await?;
        let mut report = CheckReport::new(self.name());

        let targets = probe_targets(&nodes, &mut report);
        let timeout = ctx.config.connect_timeout;
        let results = fan_out(targets, move |(node, host, expectation)| async move {
            let open = probe_open(&host, expectation.port, timeout).await;
            PortProbe {
                node,
                host,
                expectation,
                open,
            }
        })
        .await;

        let mut probes = Vec::with_capacity(results.len());
        for (_, result) in results {
            probes.push(result?);
        }
        record_port_probes(&probes, &mut report);
        Ok(report)
    }
}

/// Every `(node, address, expectation)` triple to dial
///
/// Nodes without an address are reported as failures.
pub fn probe_targets(
    nodes: &[Node],
    report: &mut CheckReport,
) -> Vec<(String, String, PortExpectation)> {
    if nodes.is_empty() {
        report.warn("no control-plane nodes found; control plane may be managed");
    }

    let mut targets = Vec::new();
    for node in nodes {
        let name = display_name(&node.metadata).to_string();
        let Some(host) = node_address(node) else {
            report.fail(format!("control-plane node {name} reports no address"));
            continue;
        };
        debug!(node = %name, host = %host, "Probing control-plane ports");
        for expectation in CONTROL_PLANE_PORTS {
            targets.push((name.clone(), host.clone(), expectation));
        }
    }
    targets
}

/// Turn probe outcomes into findings
pub fn record_port_probes(probes: &[PortProbe], report: &mut CheckReport) {
    for probe in probes {
        let PortProbe {
            node,
            host,
            expectation,
            open,
        } = probe;
        let port = expectation.port;
        let component = expectation.component;
        match classify(expectation.accessible, *open) {
            Accessibility::AccessibleAsExpected => report.pass(format!(
                "port {port} ({component}) on node {node} ({host}) is accessible as expected"
            )),
            Accessibility::CorrectlyRestricted => report.pass(format!(
                "port {port} ({component}) on node {node} ({host}) is correctly restricted"
            )),
            Accessibility::UnexpectedlyOpen => report.fail(format!(
                "port {port} ({component}) on node {node} ({host}) should not be accessible, but it is open"
            )),
            Accessibility::UnexpectedlyClosed => report.fail(format!(
                "port {port} ({component}) on node {node} ({host}) should be accessible, but it is not"
            )),
        }
    }
}

/// An endpoint address serving one of [`HTTPS_PORTS`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTarget {
    /// `namespace/name` of the Endpoints object
    pub endpoints: String,
    /// Address IP
    pub ip: String,
    /// Port number
    pub port: u16,
    /// Port name, if any
    pub port_name: Option<String>,
}

/// Every endpoint serving a control-plane port must complete a TLS handshake
#[derive(Debug, Clone, Copy)]
pub struct EndpointsHttps;

#[async_trait]
impl Check for EndpointsHttps {
    fn name(&self) -> &'static str {
        "endpoints-https"
    }

    fn description(&self) -> &'static str {
        "Endpoints on control-plane ports must be secured with TLS"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let endpoints: Api<Endpoints> = Api::all(ctx.client.clone());
        let endpoints = endpoints.list(&ListParams::default()).await?.items;
        let targets = https_targets(&endpoints);

        let timeout = ctx.config.connect_timeout;
        let results = fan_out(targets, move |target| async move {
            probe_https(&target.ip, target.port, timeout).await
        })
        .await;

        let mut secured = Vec::with_capacity(results.len());
        for (target, result) in results {
            secured.push((target, result?));
        }
        Ok(evaluate_https(self.name(), &secured))
    }
}

/// Addresses of `endpoints` listening on one of [`HTTPS_PORTS`]
pub fn https_targets(endpoints: &[Endpoints]) -> Vec<EndpointTarget> {
    let mut targets = Vec::new();
    for ep in endpoints {
        let id = format!(
            "{}/{}",
            ep.metadata.namespace.as_deref().unwrap_or_default(),
            display_name(&ep.metadata)
        );
        for subset in ep.subsets.iter().flatten() {
            let ports = subset.ports.iter().flatten();
            for port in ports {
                let Ok(number) = u16::try_from(port.port) else {
                    continue;
                };
                if !HTTPS_PORTS.contains(&number) {
                    continue;
                }
                for address in subset.addresses.iter().flatten() {
                    targets.push(EndpointTarget {
                        endpoints: id.clone(),
                        ip: address.ip.clone(),
                        port: number,
                        port_name: port.name.clone(),
                    });
                }
            }
        }
    }
    targets
}

/// Findings for TLS probe outcomes
pub fn evaluate_https(check: &str, probed: &[(EndpointTarget, bool)]) -> CheckReport {
    let mut report = CheckReport::new(check);
    if probed.is_empty() {
        report.warn("no endpoints serve control-plane ports");
    }
    for (target, secured) in probed {
        let name = target.port_name.as_deref().unwrap_or("unnamed");
        report.expect(
            *secured,
            format!(
                "endpoint {}:{} ({name}) of {} is secured via HTTPS",
                target.ip, target.port, target.endpoints
            ),
            format!(
                "endpoint {}:{} ({name}) of {} is not secured via HTTPS",
                target.ip, target.port, target.endpoints
            ),
        );
    }
    report
}
