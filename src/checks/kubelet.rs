//! Kubelet configuration checks driven by harvested `configz` snapshots

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use kaas_common::kube_utils::list_node_names;
use kaas_common::Error;

use crate::harvest::{harvest_node_data, HarvestedFile, KubeNodeProxy};
use crate::kubelet::{KubeletConfigSnapshot, CONFIGZ_ENDPOINT};
use crate::suite::{Check, CheckContext, CheckReport};

/// Which kubelet setting a check asserts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeletRule {
    /// Read-only port disabled (warning only)
    ReadOnlyPortDisabled,
    /// Anonymous authentication disabled
    AnonymousAuthDisabled,
    /// Authorization delegated to the API server via webhook
    WebhookAuthorization,
}

impl KubeletRule {
    fn apply(self, node: &str, snapshot: &KubeletConfigSnapshot, report: &mut CheckReport) {
        match self {
            KubeletRule::ReadOnlyPortDisabled => {
                if snapshot.read_only_port_disabled() {
                    report.pass(format!("kubelet read-only port is disabled on node {node}"));
                } else {
                    report.warn(format!(
                        "kubelet read-only port {} is open on node {node}",
                        snapshot.read_only_port().unwrap_or_default()
                    ));
                }
            }
            KubeletRule::AnonymousAuthDisabled => report.expect(
                snapshot.anonymous_auth_disabled(),
                format!("kubelet anonymous authentication is disabled on node {node}"),
                format!("kubelet anonymous authentication is not disabled on node {node}"),
            ),
            KubeletRule::WebhookAuthorization => report.expect(
                snapshot.authorization_mode_is_webhook(),
                format!("kubelet authorization mode is Webhook on node {node}"),
                format!(
                    "kubelet authorization mode on node {node} is not Webhook, got {}",
                    snapshot.authorization_mode().unwrap_or("<unset>")
                ),
            ),
        }
    }
}

/// Harvests `configz` from every node and applies one [`KubeletRule`]
#[derive(Debug, Clone, Copy)]
pub struct KubeletConfigCheck {
    name: &'static str,
    description: &'static str,
    rule: KubeletRule,
}

impl KubeletConfigCheck {
    /// Kubelet read-only port should be disabled
    pub fn read_only_port() -> Self {
        Self {
            name: "kubelet-read-only-port",
            description: "Kubelet read-only port (10255) should be disabled",
            rule: KubeletRule::ReadOnlyPortDisabled,
        }
    }

    /// Kubelet anonymous access must be disabled
    pub fn anonymous_auth() -> Self {
        Self {
            name: "kubelet-anonymous-auth",
            description: "Kubelet HTTPS anonymous access must be disabled",
            rule: KubeletRule::AnonymousAuthDisabled,
        }
    }

    /// Kubelet authorization must use the webhook mode
    pub fn webhook_authorization() -> Self {
        Self {
            name: "kubelet-webhook-authorization",
            description: "Kubelet authorization mode must be Webhook",
            rule: KubeletRule::WebhookAuthorization,
        }
    }
}

#[async_trait]
impl Check for KubeletConfigCheck {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        self.description
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let nodes = list_node_names(&ctx.client).await?;
        let proxy = Arc::new(KubeNodeProxy::new(
            ctx.client.clone(),
            ctx.config.proxy_timeout,
        ));
        let files = harvest_node_data(proxy, &nodes, CONFIGZ_ENDPOINT, &ctx.config.results_dir)
            .await?
            .into_files()?;

        Ok(evaluate(self.name, self.rule, &files))
    }
}

/// Apply `rule` to every harvested snapshot
///
/// A snapshot that cannot be read or parsed fails for its node only; the
/// remaining nodes are still evaluated.
pub fn evaluate(check: &str, rule: KubeletRule, files: &[HarvestedFile]) -> CheckReport {
    let mut report = CheckReport::new(check);
    if files.is_empty() {
        report.warn("no nodes found to inspect");
    }
    for file in files {
        debug!(node = %file.node, path = %file.path.display(), "Evaluating kubelet config");
        match KubeletConfigSnapshot::from_file(&file.path) {
            Ok(snapshot) => rule.apply(&file.node, &snapshot, &mut report),
            Err(e) => report.fail(format!("node {}: {e}", file.node)),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::harvest::node_file_path;
    use crate::suite::Verdict;

    use super::*;

    fn persist(dir: &Path, node: &str, body: &str) -> HarvestedFile {
        let path = node_file_path(dir, node, CONFIGZ_ENDPOINT);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        HarvestedFile {
            node: node.to_string(),
            path,
        }
    }

    const HARDENED: &str = r#"{"kubeletconfig":{"authentication":{"anonymous":{"enabled":false}},"authorization":{"mode":"Webhook"}}}"#;
    const PERMISSIVE: &str = r#"{"kubeletconfig":{"readOnlyPort":10255,"authentication":{"anonymous":{"enabled":true}},"authorization":{"mode":"AlwaysAllow"}}}"#;

    #[test]
    fn hardened_nodes_pass_every_rule() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            persist(dir.path(), "cp-0", HARDENED),
            persist(dir.path(), "worker-0", HARDENED),
        ];

        for rule in [
            KubeletRule::ReadOnlyPortDisabled,
            KubeletRule::AnonymousAuthDisabled,
            KubeletRule::WebhookAuthorization,
        ] {
            let report = evaluate("kubelet", rule, &files);
            assert!(report.passed(), "{rule:?}");
            assert_eq!(report.count(Verdict::Pass), 2);
        }
    }

    #[test]
    fn open_read_only_port_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![persist(dir.path(), "worker-0", PERMISSIVE)];

        let report = evaluate("kubelet-read-only-port", KubeletRule::ReadOnlyPortDisabled, &files);
        assert!(report.passed());
        assert_eq!(report.count(Verdict::Warn), 1);
        assert!(report.findings()[0].message.contains("10255"));
    }

    #[test]
    fn permissive_kubelet_fails_auth_rules() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            persist(dir.path(), "cp-0", HARDENED),
            persist(dir.path(), "worker-0", PERMISSIVE),
        ];

        let anonymous = evaluate("kubelet-anonymous-auth", KubeletRule::AnonymousAuthDisabled, &files);
        assert_eq!(anonymous.count(Verdict::Fail), 1);
        assert!(anonymous.failure_messages()[0].contains("worker-0"));

        let webhook = evaluate(
            "kubelet-webhook-authorization",
            KubeletRule::WebhookAuthorization,
            &files,
        );
        assert_eq!(webhook.count(Verdict::Fail), 1);
        assert!(webhook.failure_messages()[0].contains("AlwaysAllow"));
    }

    /// A garbled snapshot fails its own node and the loop moves on
    #[test]
    fn malformed_snapshot_fails_one_node_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            persist(dir.path(), "cp-0", "not json"),
            persist(dir.path(), "worker-0", HARDENED),
        ];

        let report = evaluate("kubelet-anonymous-auth", KubeletRule::AnonymousAuthDisabled, &files);
        assert!(!report.passed());
        assert_eq!(report.count(Verdict::Fail), 1);
        assert_eq!(report.count(Verdict::Pass), 1);
        assert!(report.failure_messages()[0].contains("cp-0"));
        assert!(report.failure_messages()[0].contains("failed to read/parse kubelet configuration"));
    }

    #[test]
    fn missing_snapshot_file_fails_that_node() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![HarvestedFile {
            node: "ghost".to_string(),
            path: node_file_path(dir.path(), "ghost", CONFIGZ_ENDPOINT),
        }];

        let report = evaluate("kubelet-read-only-port", KubeletRule::ReadOnlyPortDisabled, &files);
        assert!(!report.passed());
    }

    #[test]
    fn no_nodes_is_a_warning() {
        let report = evaluate("kubelet-anonymous-auth", KubeletRule::AnonymousAuthDisabled, &[]);
        assert!(report.passed());
        assert_eq!(report.count(Verdict::Warn), 1);
    }
}
