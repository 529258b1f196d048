//! etcd maintenance: compaction settings and backups

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::Api;

use kaas_common::kube_utils::{is_kind_cluster, list_etcd_pods, list_nodes};
use kaas_common::{Error, KUBE_SYSTEM_NAMESPACE};

use super::flags::ComponentFlags;
use super::{list_named, skip_on_kind, NamedObject};
use crate::suite::{Check, CheckContext, CheckReport};

/// ConfigMap that may hold the etcd configuration file
pub const ETCD_CONFIG_MAP: &str = "etcd-config";
const ETCD_CONFIG_KEY: &str = "etcd.conf.yaml";

/// Required compaction settings as (setting, value)
pub const REQUIRED_COMPACTION: [(&str, &str); 2] = [
    ("auto-compaction-mode", "periodic"),
    ("auto-compaction-retention", "8h"),
];

/// etcd must compact its history periodically with an 8h retention
#[derive(Debug, Clone, Copy)]
pub struct EtcdCompaction;

#[async_trait]
impl Check for EtcdCompaction {
    fn name(&self) -> &'static str {
        "etcd-compaction"
    }

    fn description(&self) -> &'static str {
        "etcd must use periodic auto-compaction with an 8h retention"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let kind = is_kind_cluster(&list_nodes(&ctx.client).await?);
        let pods = list_etcd_pods(&ctx.client).await?;
        let flags: Vec<_> = pods.iter().map(ComponentFlags::from_pod).collect();

        let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), KUBE_SYSTEM_NAMESPACE);
        let config = config_maps
            .get_opt(ETCD_CONFIG_MAP)
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(ETCD_CONFIG_KEY));

        Ok(evaluate_compaction(
            self.name(),
            kind,
            &flags,
            config.as_deref(),
        ))
    }
}

/// Whether an etcd configuration file carries the required settings
fn config_has_compaction(config: &str) -> bool {
    REQUIRED_COMPACTION
        .iter()
        .all(|(setting, value)| config.contains(&format!("{setting}: {value}")))
}

/// Required settings missing from an etcd pod's flags, as `--setting=value`
fn missing_compaction_flags(flags: &ComponentFlags) -> Vec<String> {
    REQUIRED_COMPACTION
        .iter()
        .filter(|(setting, value)| flags.value(&format!("--{setting}")) != Some(*value))
        .map(|(setting, value)| format!("--{setting}={value}"))
        .collect()
}

/// Findings for etcd compaction
///
/// A configuration file in [`ETCD_CONFIG_MAP`] with both settings covers
/// every pod; otherwise each etcd pod's flags must carry them.
pub fn evaluate_compaction(
    check: &str,
    kind: bool,
    etcd_pods: &[ComponentFlags],
    etcd_config: Option<&str>,
) -> CheckReport {
    let mut report = CheckReport::new(check);
    if skip_on_kind(kind, &mut report) {
        return report;
    }
    if etcd_pods.is_empty() {
        report.warn("no etcd pods found in kube-system; etcd may run outside the cluster");
        return report;
    }
    if etcd_config.is_some_and(config_has_compaction) {
        report.pass(format!(
            "compaction settings found in ConfigMap {KUBE_SYSTEM_NAMESPACE}/{ETCD_CONFIG_MAP}"
        ));
        return report;
    }

    for flags in etcd_pods {
        let missing = missing_compaction_flags(flags);
        report.expect(
            missing.is_empty(),
            format!("etcd pod {} compacts periodically with 8h retention", flags.pod()),
            format!(
                "etcd pod {} is missing compaction settings: {}",
                flags.pod(),
                missing.join(", ")
            ),
        );
    }
    report
}

/// A backup job for etcd must exist
#[derive(Debug, Clone, Copy)]
pub struct EtcdBackup;

#[async_trait]
impl Check for EtcdBackup {
    fn name(&self) -> &'static str {
        "etcd-backup"
    }

    fn description(&self) -> &'static str {
        "etcd must be backed up by a CronJob, Deployment, DaemonSet or dedicated Pod"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let kind = is_kind_cluster(&list_nodes(&ctx.client).await?);
        let mut objects = list_named::<CronJob>(&ctx.client).await?;
        objects.extend(list_named::<Deployment>(&ctx.client).await?);
        objects.extend(list_named::<DaemonSet>(&ctx.client).await?);
        objects.extend(list_named::<Pod>(&ctx.client).await?);
        Ok(evaluate_backup(self.name(), kind, &objects))
    }
}

/// Whether an object name looks like an etcd backup
pub fn is_etcd_backup(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("etcd") && name.contains("backup")
}

/// Findings for etcd backups, given candidate objects in search order
pub fn evaluate_backup(check: &str, kind: bool, objects: &[NamedObject]) -> CheckReport {
    let mut report = CheckReport::new(check);
    if skip_on_kind(kind, &mut report) {
        return report;
    }
    match objects.iter().find(|o| is_etcd_backup(&o.name)) {
        Some(object) => report.pass(format!("etcd backup found: {object}")),
        None => report.fail(
            "no etcd backup found; expected a CronJob, Deployment, DaemonSet or Pod \
             with etcd and backup in its name",
        ),
    }
    report
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::suite::Verdict;

    use super::*;

    fn etcd(args: &[&str]) -> ComponentFlags {
        let mut all = vec!["etcd".to_string()];
        all.extend(args.iter().map(|s| s.to_string()));
        ComponentFlags::new("etcd-cp-0", all)
    }

    fn object(kind: &str, namespace: &str, name: &str) -> NamedObject {
        NamedObject::new(
            kind,
            &ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn compaction_flags_pass() {
        let pods = [etcd(&[
            "--auto-compaction-mode=periodic",
            "--auto-compaction-retention=8h",
        ])];
        let report = evaluate_compaction("etcd-compaction", false, &pods, None);
        assert!(report.passed());
        assert_eq!(report.count(Verdict::Pass), 1);
    }

    #[test]
    fn wrong_or_missing_compaction_flags_are_named() {
        let pods = [etcd(&[
            "--auto-compaction-mode=revision",
            "--auto-compaction-retention=8h",
        ])];
        let report = evaluate_compaction("etcd-compaction", false, &pods, None);
        let message = report.failure_messages()[0];
        assert!(message.contains("--auto-compaction-mode=periodic"));
        assert!(!message.contains("retention"));
    }

    #[test]
    fn config_map_settings_cover_every_pod() {
        let pods = [etcd(&[])];
        let config = "auto-compaction-mode: periodic\nauto-compaction-retention: 8h\n";
        let report = evaluate_compaction("etcd-compaction", false, &pods, Some(config));
        assert!(report.passed());

        let partial = "auto-compaction-mode: periodic\n";
        let report = evaluate_compaction("etcd-compaction", false, &pods, Some(partial));
        assert_eq!(report.count(Verdict::Fail), 1);
    }

    #[test]
    fn every_etcd_pod_is_checked() {
        let good = etcd(&[
            "--auto-compaction-mode=periodic",
            "--auto-compaction-retention=8h",
        ]);
        let bad = ComponentFlags::new("etcd-cp-1", vec!["etcd".to_string()]);
        let report = evaluate_compaction("etcd-compaction", false, &[good, bad], None);
        assert_eq!(report.count(Verdict::Pass), 1);
        assert!(report.failure_messages()[0].contains("etcd-cp-1"));
    }

    #[test]
    fn external_etcd_and_kind_are_warnings() {
        let report = evaluate_compaction("etcd-compaction", false, &[], None);
        assert!(report.passed());
        assert_eq!(report.count(Verdict::Warn), 1);

        let report = evaluate_compaction("etcd-compaction", true, &[etcd(&[])], None);
        assert!(report.passed());
        assert_eq!(report.count(Verdict::Warn), 1);
    }

    #[test]
    fn backup_names_need_both_words() {
        assert!(is_etcd_backup("etcd-backup"));
        assert!(is_etcd_backup("Nightly-ETCD-Snapshot-Backup"));
        assert!(!is_etcd_backup("etcd-cp-0"));
        assert!(!is_etcd_backup("velero-backup"));
    }

    #[test]
    fn backup_cron_job_passes() {
        let objects = [
            object("Deployment", "kube-system", "coredns"),
            object("CronJob", "kube-system", "etcd-backup-weekly"),
        ];
        let report = evaluate_backup("etcd-backup", false, &objects);
        assert!(report.passed());
        assert!(report.findings()[0]
            .message
            .contains("CronJob kube-system/etcd-backup-weekly"));
    }

    #[test]
    fn missing_backup_fails_outside_kind() {
        let objects = [object("Pod", "kube-system", "etcd-cp-0")];
        assert_eq!(
            evaluate_backup("etcd-backup", false, &objects).count(Verdict::Fail),
            1
        );
        assert!(evaluate_backup("etcd-backup", true, &objects).passed());
    }
}
