//! Container registry standard
//!
//! The cluster must host Harbor as its registry. Other self-hosted
//! registries are not accepted.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;

use kaas_common::Error;

use super::{list_named, NamedObject};
use crate::suite::{Check, CheckContext, CheckReport};

/// Components a Harbor installation must run
pub const HARBOR_COMPONENTS: [&str; 6] = [
    "harbor-core",
    "harbor-db",
    "harbor-jobservice",
    "harbor-portal",
    "harbor-registry",
    "nginx",
];

/// Registries that do not satisfy the standard
pub const OTHER_REGISTRIES: [&str; 8] = [
    "docker-registry",
    "quay",
    "jfrog",
    "artifacthub",
    "dragonfly",
    "keppel",
    "nexus",
    "kraken",
];

/// Harbor must be the cluster's container registry
#[derive(Debug, Clone, Copy)]
pub struct RegistryStandard;

#[async_trait]
impl Check for RegistryStandard {
    fn name(&self) -> &'static str {
        "registry-standard"
    }

    fn description(&self) -> &'static str {
        "Harbor must be deployed as the container registry"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let mut objects = list_named::<Deployment>(&ctx.client).await?;
        objects.extend(list_named::<Service>(&ctx.client).await?);
        Ok(evaluate(self.name(), &objects))
    }
}

/// Findings for the registry standard over Deployments and Services
pub fn evaluate(check: &str, objects: &[NamedObject]) -> CheckReport {
    let mut report = CheckReport::new(check);

    for registry in OTHER_REGISTRIES {
        if let Some(object) = objects.iter().find(|o| o.name.contains(registry)) {
            report.fail(format!("unsupported registry {registry} found: {object}"));
        }
    }

    let missing: Vec<&str> = HARBOR_COMPONENTS
        .iter()
        .copied()
        .filter(|component| !objects.iter().any(|o| o.name.contains(component)))
        .collect();
    report.expect(
        missing.is_empty(),
        "all Harbor components are deployed",
        format!("missing Harbor components: {}", missing.join(", ")),
    );
    report
}
