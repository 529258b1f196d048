//! Pod Security admission and namespace enforcement levels

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};

use kaas_common::kube_utils::{display_name, list_apiserver_pods};
use kaas_common::Error;

use super::apiserver::{warn_if_no_pods, ENABLE_ADMISSION_PLUGINS};
use super::flags::ComponentFlags;
use crate::suite::{Check, CheckContext, CheckReport};

/// Label (or annotation) carrying a namespace's enforced Pod Security level
pub const ENFORCE_LEVEL_KEY: &str = "pod-security.kubernetes.io/enforce";

const DISABLE_ADMISSION_PLUGINS: &str = "--disable-admission-plugins";
const POD_SECURITY_PLUGIN: &str = "PodSecurity";

/// PodSecurity admission must be enabled and namespaces should enforce
/// `baseline` or `restricted`
#[derive(Debug, Clone, Copy)]
pub struct PodSecurity;

#[async_trait]
impl Check for PodSecurity {
    fn name(&self) -> &'static str {
        "pod-security"
    }

    fn description(&self) -> &'static str {
        "PodSecurity admission must be enabled and namespaces must enforce baseline or restricted"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let pods = list_apiserver_pods(&ctx.client).await?;
        let flags: Vec<_> = pods.iter().map(ComponentFlags::from_pod).collect();

        let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
        let namespaces = namespaces.list(&ListParams::default()).await?.items;

        Ok(evaluate(self.name(), &flags, &namespaces))
    }
}

/// Enforcement level of a namespace: label first, then annotation
pub fn enforce_level(namespace: &Namespace) -> Option<&str> {
    let meta = &namespace.metadata;
    meta.labels
        .as_ref()
        .and_then(|l| l.get(ENFORCE_LEVEL_KEY))
        .or_else(|| {
            meta.annotations
                .as_ref()
                .and_then(|a| a.get(ENFORCE_LEVEL_KEY))
        })
        .map(String::as_str)
}

/// Evaluate the admission plugin flags and every namespace's level
pub fn evaluate(check: &str, pods: &[ComponentFlags], namespaces: &[Namespace]) -> CheckReport {
    let mut report = CheckReport::new(check);

    if !warn_if_no_pods(pods, &mut report) {
        for flags in pods {
            admission_enabled(flags, &mut report);
        }
    }

    for namespace in namespaces {
        let name = display_name(&namespace.metadata);
        match enforce_level(namespace) {
            None => report.warn(format!(
                "namespace {name} does not declare a Pod Security enforce level"
            )),
            Some(level @ ("baseline" | "restricted")) => {
                report.pass(format!("namespace {name} enforces the {level} policy"))
            }
            Some(level) => report.fail(format!(
                "namespace {name} enforces {level} instead of baseline or restricted"
            )),
        }
    }

    report
}

fn admission_enabled(flags: &ComponentFlags, report: &mut CheckReport) {
    let pod = flags.pod();
    let disabled = flags
        .list(DISABLE_ADMISSION_PLUGINS)
        .is_some_and(|p| p.contains(&POD_SECURITY_PLUGIN));
    if disabled {
        report.fail(format!(
            "PodSecurity admission plugin is disabled in pod {pod}"
        ));
        return;
    }

    match flags.list(ENABLE_ADMISSION_PLUGINS) {
        None => report.fail(format!(
            "{ENABLE_ADMISSION_PLUGINS} flag not found in pod {pod}"
        )),
        Some(plugins) => report.expect(
            plugins.contains(&POD_SECURITY_PLUGIN),
            format!("PodSecurity admission plugin is enabled in pod {pod}"),
            format!("PodSecurity admission plugin is not enabled in pod {pod}"),
        ),
    }
}
