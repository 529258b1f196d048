//! Event rate limiting and API Priority and Fairness
//!
//! Settings are looked up in the admission and kube-apiserver ConfigMaps of
//! `kube-system`, in kube-apiserver flags and, for APF, in API discovery.
//! kind clusters are skipped with a warning.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Client, ResourceExt};
use tracing::debug;

use kaas_common::kube_utils::{
    is_kind_cluster, list_apiserver_pods, list_config_maps, list_nodes,
};
use kaas_common::{Error, KUBE_SYSTEM_NAMESPACE};

use super::apiserver::ENABLE_ADMISSION_PLUGINS;
use super::flags::ComponentFlags;
use super::{config_map_value, skip_on_kind};
use crate::suite::{Check, CheckContext, CheckReport};

/// ConfigMap holding the admission plugin configuration
pub const ADMISSION_CONFIG_MAP: &str = "admission-configuration";
/// ConfigMap holding the kube-apiserver configuration file
pub const APISERVER_CONFIG_MAP: &str = "kube-apiserver";
/// Name fragment of standalone event rate limit ConfigMaps
pub const EVENT_RATE_LIMIT_FRAGMENT: &str = "event-rate-limit";

const EVENT_RATE_LIMIT_KEY: &str = "eventratelimit.yaml";
const APISERVER_CONFIG_KEY: &str = "config.yaml";
const EVENT_RATE_LIMIT_API_GROUP: &str = "eventratelimit.admission.k8s.io";
const EVENT_RATE_LIMIT_PLUGIN: &str = "EventRateLimit";

const APF_CONFIG_ENTRY: &str = "enable-priority-and-fairness: true";
const APF_FLAG: &str = "--enable-priority-and-fairness";
const FLOW_CONTROL_VERSIONS: [&str; 2] = [
    "flowcontrol.apiserver.k8s.io/v1",
    "flowcontrol.apiserver.k8s.io/v1beta3",
];
const FLOW_CONTROL_RESOURCES: [&str; 2] = ["flowschemas", "prioritylevelconfigurations"];

/// Recommended event rate limit settings
pub const RECOMMENDED_RATE_LIMITS: [&str; 2] = ["qps: 5000", "burst: 20000"];

/// The EventRateLimit admission controller must be configured
#[derive(Debug, Clone, Copy)]
pub struct EventRateLimit;

#[async_trait]
impl Check for EventRateLimit {
    fn name(&self) -> &'static str {
        "event-rate-limit"
    }

    fn description(&self) -> &'static str {
        "EventRateLimit admission controller must be configured"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let kind = is_kind_cluster(&list_nodes(&ctx.client).await?);
        let config_maps = list_config_maps(&ctx.client, KUBE_SYSTEM_NAMESPACE).await?;
        let pods = list_apiserver_pods(&ctx.client).await?;
        let flags: Vec<_> = pods.iter().map(ComponentFlags::from_pod).collect();
        Ok(evaluate_event_rate_limit(
            self.name(),
            kind,
            &config_maps,
            &flags,
        ))
    }
}

/// Where EventRateLimit is configured, if anywhere
pub fn event_rate_limit_source(
    config_maps: &[ConfigMap],
    apiservers: &[ComponentFlags],
) -> Option<String> {
    let locations = [
        (ADMISSION_CONFIG_MAP, EVENT_RATE_LIMIT_KEY),
        (APISERVER_CONFIG_MAP, APISERVER_CONFIG_KEY),
    ];
    for (name, key) in locations {
        if config_map_value(config_maps, name, key)
            .is_some_and(|data| data.contains(EVENT_RATE_LIMIT_API_GROUP))
        {
            return Some(format!("ConfigMap {KUBE_SYSTEM_NAMESPACE}/{name}"));
        }
    }

    if let Some(cm) = config_maps
        .iter()
        .find(|cm| cm.name_any().contains(EVENT_RATE_LIMIT_FRAGMENT))
    {
        return Some(format!(
            "standalone ConfigMap {KUBE_SYSTEM_NAMESPACE}/{}",
            cm.name_any()
        ));
    }

    apiservers
        .iter()
        .find(|flags| {
            flags
                .list(ENABLE_ADMISSION_PLUGINS)
                .is_some_and(|plugins| plugins.contains(&EVENT_RATE_LIMIT_PLUGIN))
        })
        .map(|flags| format!("admission plugins of pod {}", flags.pod()))
}

/// Findings for the EventRateLimit configuration
pub fn evaluate_event_rate_limit(
    check: &str,
    kind: bool,
    config_maps: &[ConfigMap],
    apiservers: &[ComponentFlags],
) -> CheckReport {
    let mut report = CheckReport::new(check);
    if skip_on_kind(kind, &mut report) {
        return report;
    }
    match event_rate_limit_source(config_maps, apiservers) {
        Some(source) => report.pass(format!("EventRateLimit is configured in {source}")),
        None => report.fail("no EventRateLimit configuration found"),
    }
    report
}

/// API Priority and Fairness must be enabled
#[derive(Debug, Clone, Copy)]
pub struct ApiPriorityAndFairness;

#[async_trait]
impl Check for ApiPriorityAndFairness {
    fn name(&self) -> &'static str {
        "api-priority-and-fairness"
    }

    fn description(&self) -> &'static str {
        "API Priority and Fairness must be enabled in kube-apiserver"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let kind = is_kind_cluster(&list_nodes(&ctx.client).await?);
        let config_maps = list_config_maps(&ctx.client, KUBE_SYSTEM_NAMESPACE).await?;
        let pods = list_apiserver_pods(&ctx.client).await?;
        let flags: Vec<_> = pods.iter().map(ComponentFlags::from_pod).collect();
        let resources = flow_control_resources(&ctx.client).await;
        Ok(evaluate_priority_and_fairness(
            self.name(),
            kind,
            &config_maps,
            &flags,
            &resources,
        ))
    }
}

/// Resource names served by the first available flowcontrol API version
///
/// A version that cannot be discovered counts as serving nothing.
async fn flow_control_resources(client: &Client) -> Vec<String> {
    for version in FLOW_CONTROL_VERSIONS {
        match client.list_api_group_resources(version).await {
            Ok(list) => return list.resources.into_iter().map(|r| r.name).collect(),
            Err(e) => debug!(version, error = %e, "flowcontrol API version not served"),
        }
    }
    Vec::new()
}

/// Findings for the APF configuration
pub fn evaluate_priority_and_fairness(
    check: &str,
    kind: bool,
    config_maps: &[ConfigMap],
    apiservers: &[ComponentFlags],
    flow_control_resources: &[String],
) -> CheckReport {
    let mut report = CheckReport::new(check);
    if skip_on_kind(kind, &mut report) {
        return report;
    }

    if config_map_value(config_maps, APISERVER_CONFIG_MAP, APISERVER_CONFIG_KEY)
        .is_some_and(|data| data.contains(APF_CONFIG_ENTRY))
    {
        report.pass(format!(
            "APF enabled in ConfigMap {KUBE_SYSTEM_NAMESPACE}/{APISERVER_CONFIG_MAP}"
        ));
    } else if let Some(flags) = apiservers
        .iter()
        .find(|flags| flags.value(APF_FLAG) == Some("true"))
    {
        report.pass(format!("APF enabled by {APF_FLAG} in pod {}", flags.pod()));
    } else if let Some(resource) = flow_control_resources
        .iter()
        .find(|r| FLOW_CONTROL_RESOURCES.contains(&r.as_str()))
    {
        report.pass(format!("APF enabled: the API server serves {resource}"));
    } else {
        report.fail("no API Priority and Fairness configuration found");
    }
    report
}

/// Event rate limits should use the recommended values
#[derive(Debug, Clone, Copy)]
pub struct RateLimitValues;

#[async_trait]
impl Check for RateLimitValues {
    fn name(&self) -> &'static str {
        "rate-limit-values"
    }

    fn description(&self) -> &'static str {
        "Event rate limits must use the recommended qps 5000 and burst 20000"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let kind = is_kind_cluster(&list_nodes(&ctx.client).await?);
        let config_maps = list_config_maps(&ctx.client, KUBE_SYSTEM_NAMESPACE).await?;
        Ok(evaluate_rate_limit_values(self.name(), kind, &config_maps))
    }
}

/// Rate limit configuration text a ConfigMap may carry
fn rate_limit_config(cm: &ConfigMap) -> Option<&str> {
    let name = cm.name_any();
    let key = if name.contains(EVENT_RATE_LIMIT_FRAGMENT) {
        APISERVER_CONFIG_KEY
    } else if name == ADMISSION_CONFIG_MAP {
        EVENT_RATE_LIMIT_KEY
    } else if name == APISERVER_CONFIG_MAP {
        APISERVER_CONFIG_KEY
    } else {
        return None;
    };
    cm.data.as_ref()?.get(key).map(String::as_str)
}

/// Findings for the configured rate limit values
pub fn evaluate_rate_limit_values(check: &str, kind: bool, config_maps: &[ConfigMap]) -> CheckReport {
    let mut report = CheckReport::new(check);
    if skip_on_kind(kind, &mut report) {
        return report;
    }

    let found = config_maps.iter().find(|cm| {
        rate_limit_config(cm)
            .is_some_and(|config| RECOMMENDED_RATE_LIMITS.iter().all(|v| config.contains(v)))
    });
    match found {
        Some(cm) => report.pass(format!(
            "recommended rate limits ({}) found in ConfigMap {KUBE_SYSTEM_NAMESPACE}/{}",
            RECOMMENDED_RATE_LIMITS.join(", "),
            cm.name_any()
        )),
        None => report.fail(format!(
            "recommended rate limit values ({}) not found",
            RECOMMENDED_RATE_LIMITS.join(", ")
        )),
    }
    report
}
