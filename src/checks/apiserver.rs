//! kube-apiserver command-line flag checks
//!
//! Flags are read from the static kube-apiserver pods in `kube-system`. On
//! managed control planes those pods are invisible, which is reported as a
//! warning rather than a silent pass.

use async_trait::async_trait;

use kaas_common::kube_utils::list_apiserver_pods;
use kaas_common::Error;

use super::flags::ComponentFlags;
use crate::suite::{Check, CheckContext, CheckReport};

/// Flag evaluation for one pod
pub type FlagRule = fn(&ComponentFlags, &mut CheckReport);

/// A check that applies one [`FlagRule`] to every kube-apiserver pod
#[derive(Clone, Copy)]
pub struct ApiServerFlagCheck {
    name: &'static str,
    description: &'static str,
    rule: FlagRule,
}

impl ApiServerFlagCheck {
    /// NodeRestriction admission plugin must be enabled
    pub fn node_restriction() -> Self {
        Self {
            name: "node-restriction-admission",
            description: "NodeRestriction admission plugin must be enabled in kube-apiserver",
            rule: node_restriction,
        }
    }

    /// Node authorization plus one of ABAC, RBAC or Webhook
    pub fn authorization_modes() -> Self {
        Self {
            name: "authorization-modes",
            description: "Node authorization and one of ABAC, RBAC or Webhook must be enabled",
            rule: authorization_modes,
        }
    }

    /// Service account tokens plus a second authentication method
    pub fn authentication_methods() -> Self {
        Self {
            name: "authentication-methods",
            description: "Service account tokens and a second authentication method must be enabled",
            rule: authentication_methods,
        }
    }

    /// kube-apiserver must talk to etcd over TLS
    pub fn etcd_tls() -> Self {
        Self {
            name: "etcd-tls",
            description: "kube-apiserver must communicate with etcd using TLS",
            rule: etcd_tls,
        }
    }

    /// etcd should not share the control-plane host
    pub fn etcd_isolation() -> Self {
        Self {
            name: "etcd-isolation",
            description: "etcd should be isolated from the Kubernetes control-plane hosts",
            rule: etcd_isolation,
        }
    }
}

#[async_trait]
impl Check for ApiServerFlagCheck {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        self.description
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let pods = list_apiserver_pods(&ctx.client).await?;
        let flags: Vec<_> = pods.iter().map(ComponentFlags::from_pod).collect();
        Ok(evaluate(self.name, self.rule, &flags))
    }
}

/// Apply `rule` to every pod, warning when there are none
pub fn evaluate(check: &str, rule: FlagRule, pods: &[ComponentFlags]) -> CheckReport {
    let mut report = CheckReport::new(check);
    if !warn_if_no_pods(pods, &mut report) {
        for flags in pods {
            rule(flags, &mut report);
        }
    }
    report
}

/// Record a warning and return true when no kube-apiserver pod is visible
pub(crate) fn warn_if_no_pods(pods: &[ComponentFlags], report: &mut CheckReport) -> bool {
    if pods.is_empty() {
        report.warn("no kube-apiserver pods visible in kube-system; control plane may be managed");
        return true;
    }
    false
}

pub(crate) const ENABLE_ADMISSION_PLUGINS: &str = "--enable-admission-plugins";
const AUTHORIZATION_MODE: &str = "--authorization-mode";
const SERVICE_ACCOUNT_ISSUER: &str = "--service-account-issuer";
const TOKEN_WEBHOOK_CONFIG: &str = "--authentication-token-webhook-config-file";
const OIDC_ISSUER_URL: &str = "--oidc-issuer-url";
const ETCD_TLS_FLAGS: [&str; 3] = ["--etcd-certfile", "--etcd-keyfile", "--etcd-cafile"];
const ETCD_SERVERS: &str = "--etcd-servers";

fn node_restriction(flags: &ComponentFlags, report: &mut CheckReport) {
    let pod = flags.pod();
    match flags.list(ENABLE_ADMISSION_PLUGINS) {
        None => report.fail(format!(
            "{ENABLE_ADMISSION_PLUGINS} flag not found in pod {pod}"
        )),
        Some(plugins) => report.expect(
            plugins.contains(&"NodeRestriction"),
            format!("NodeRestriction admission plugin is enabled in pod {pod}"),
            format!("NodeRestriction admission plugin is not enabled in pod {pod}"),
        ),
    }
}

fn authorization_modes(flags: &ComponentFlags, report: &mut CheckReport) {
    let pod = flags.pod();
    let Some(modes) = flags.list(AUTHORIZATION_MODE) else {
        report.fail(format!("{AUTHORIZATION_MODE} flag not found in pod {pod}"));
        return;
    };

    let node = modes.contains(&"Node");
    let other = modes
        .iter()
        .any(|m| matches!(*m, "ABAC" | "RBAC" | "Webhook"));
    match (node, other) {
        (true, true) => report.pass(format!(
            "pod {pod} authorizes with {}, including Node",
            modes.join(",")
        )),
        (false, _) => report.fail(format!("Node authorization is not enabled in pod {pod}")),
        (true, false) => report.fail(format!(
            "none of ABAC, RBAC or Webhook authorization is enabled in pod {pod}"
        )),
    }
}

fn authentication_methods(flags: &ComponentFlags, report: &mut CheckReport) {
    let pod = flags.pod();
    let service_accounts = flags.has(SERVICE_ACCOUNT_ISSUER);
    let other = flags.has(TOKEN_WEBHOOK_CONFIG) || flags.has(OIDC_ISSUER_URL);

    if service_accounts && other {
        report.pass(format!(
            "service account tokens and a second authentication method are enabled in pod {pod}"
        ));
        return;
    }
    if !service_accounts {
        report.fail(format!(
            "service account tokens are not enabled in pod {pod} ({SERVICE_ACCOUNT_ISSUER} missing)"
        ));
    }
    if !other {
        report.fail(format!(
            "no second authentication method in pod {pod} ({TOKEN_WEBHOOK_CONFIG} or {OIDC_ISSUER_URL})"
        ));
    }
}

fn etcd_tls(flags: &ComponentFlags, report: &mut CheckReport) {
    let pod = flags.pod();
    let missing: Vec<&str> = ETCD_TLS_FLAGS
        .into_iter()
        .filter(|f| !flags.has(f))
        .collect();
    report.expect(
        missing.is_empty(),
        format!("kube-apiserver pod {pod} communicates with etcd using TLS"),
        format!(
            "kube-apiserver pod {pod} is missing etcd TLS flags: {}",
            missing.join(", ")
        ),
    );
}

fn etcd_isolation(flags: &ComponentFlags, report: &mut CheckReport) {
    let pod = flags.pod();
    let Some(endpoints) = flags.list(ETCD_SERVERS) else {
        report.fail(format!("{ETCD_SERVERS} flag is missing in pod {pod}"));
        return;
    };
    for endpoint in endpoints {
        if endpoint.contains("localhost") || endpoint.contains("127.0.0.1") {
            report.warn(format!(
                "etcd runs on the control-plane host for pod {pod}: {endpoint}"
            ));
        } else {
            report.pass(format!("etcd is isolated at endpoint {endpoint}"));
        }
    }
}
