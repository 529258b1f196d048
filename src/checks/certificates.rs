//! Certificate lifetime and rotation
//!
//! TLS certificates stored in `kube-system` Secrets must stay valid for at
//! least a year, and a certificate controller must be running to renew them.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use x509_parser::prelude::*;

use kaas_common::kube_utils::{is_kind_cluster, list_nodes, list_pods_by_selector};
use kaas_common::{Error, CONTROLLER_MANAGER_LABEL_SELECTOR, KUBE_SYSTEM_NAMESPACE};

use super::flags::ComponentFlags;
use super::skip_on_kind;
use crate::suite::{Check, CheckContext, CheckReport};

/// Minimum remaining validity of a stored certificate
pub const MIN_REMAINING_VALIDITY_SECS: i64 = 365 * 24 * 60 * 60;

/// Name fragments of Deployments that renew certificates
pub const CERT_CONTROLLER_NAMES: [&str; 3] =
    ["cert-manager", "certificate-controller", "cert-controller"];

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
const TLS_CERT_KEY: &str = "tls.crt";
const CONTROLLERS_FLAG: &str = "--controllers";

/// Expiry of a parsed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateExpiry {
    /// Unix timestamp after which the certificate is invalid
    pub not_after: i64,
    /// `not_after` in human-readable form
    pub display: String,
}

impl CertificateExpiry {
    /// Parse the first certificate of a PEM bundle
    pub fn from_pem(data: &[u8]) -> Result<Self, String> {
        let pem = ::pem::parse(data).map_err(|e| format!("failed to decode PEM: {e}"))?;
        let (_, cert) = X509Certificate::from_der(pem.contents())
            .map_err(|e| format!("failed to parse certificate: {e}"))?;
        let not_after = &cert.validity().not_after;
        Ok(Self {
            not_after: not_after.timestamp(),
            display: not_after.to_string(),
        })
    }
}

/// Certificate bytes of a Secret: `tls.crt` first, then the first key
/// that looks like a certificate
pub fn certificate_data(secret: &Secret) -> Option<&[u8]> {
    let data = secret.data.as_ref()?;
    data.get(TLS_CERT_KEY)
        .or_else(|| {
            data.iter()
                .find(|(key, _)| key.contains(".crt") || key.contains("cert"))
                .map(|(_, value)| value)
        })
        .map(|bytes| bytes.0.as_slice())
}

/// Whether a Secret is expected to hold a certificate
fn is_certificate_secret(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(TLS_SECRET_TYPE) || secret.name_any().contains("cert")
}

/// Certificates must outlive a year and a controller must rotate them
#[derive(Debug, Clone, Copy)]
pub struct CertificateRotation;

#[async_trait]
impl Check for CertificateRotation {
    fn name(&self) -> &'static str {
        "certificate-rotation"
    }

    fn description(&self) -> &'static str {
        "Stored certificates must be valid for a year and a certificate controller must run"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let kind = is_kind_cluster(&list_nodes(&ctx.client).await?);

        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), KUBE_SYSTEM_NAMESPACE);
        let secrets = secrets.list(&ListParams::default()).await?.items;
        let deployments: Api<Deployment> = Api::all(ctx.client.clone());
        let deployments = deployments.list(&ListParams::default()).await?.items;
        let controller_managers = list_pods_by_selector(
            &ctx.client,
            KUBE_SYSTEM_NAMESPACE,
            CONTROLLER_MANAGER_LABEL_SELECTOR,
        )
        .await?;
        let controller_managers: Vec<_> = controller_managers
            .iter()
            .map(ComponentFlags::from_pod)
            .collect();

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::internal_with_context("certificates", e.to_string()))?
            .as_secs() as i64;

        Ok(evaluate(
            self.name(),
            kind,
            now,
            &secrets,
            &deployments,
            &controller_managers,
        ))
    }
}

/// Findings for stored certificates and the rotating controller
pub fn evaluate(
    check: &str,
    kind: bool,
    now: i64,
    secrets: &[Secret],
    deployments: &[Deployment],
    controller_managers: &[ComponentFlags],
) -> CheckReport {
    let mut report = CheckReport::new(check);
    if skip_on_kind(kind, &mut report) {
        return report;
    }
    evaluate_expiry(now, secrets, &mut report);
    evaluate_controller(deployments, controller_managers, &mut report);
    report
}

fn evaluate_expiry(now: i64, secrets: &[Secret], report: &mut CheckReport) {
    let mut checked = 0;
    for secret in secrets.iter().filter(|s| is_certificate_secret(s)) {
        let name = secret.name_any();
        let Some(data) = certificate_data(secret) else {
            continue;
        };
        let expiry = match CertificateExpiry::from_pem(data) {
            Ok(expiry) => expiry,
            Err(e) => {
                report.warn(format!("skipping certificate in secret {name}: {e}"));
                continue;
            }
        };

        checked += 1;
        report.expect(
            expiry.not_after - now >= MIN_REMAINING_VALIDITY_SECS,
            format!("certificate in secret {name} expires {}", expiry.display),
            format!(
                "certificate in secret {name} expires in less than a year ({})",
                expiry.display
            ),
        );
    }

    if checked == 0 {
        report.fail(format!("no certificates found to check in {KUBE_SYSTEM_NAMESPACE}"));
    }
}

fn evaluate_controller(
    deployments: &[Deployment],
    controller_managers: &[ComponentFlags],
    report: &mut CheckReport,
) {
    let active = deployments.iter().find(|d| {
        let name = d.name_any().to_ascii_lowercase();
        let ready = d
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        ready > 0 && CERT_CONTROLLER_NAMES.iter().any(|c| name.contains(c))
    });
    if let Some(deployment) = active {
        report.pass(format!(
            "certificate controller {} is running",
            deployment.name_any()
        ));
        return;
    }

    let builtin = controller_managers.iter().find(|flags| {
        flags.list(CONTROLLERS_FLAG).is_some_and(|controllers| {
            controllers
                .iter()
                .any(|c| *c == "*" || c.starts_with("certificate"))
        })
    });
    match builtin {
        Some(flags) => report.pass(format!(
            "built-in certificate controllers enabled in pod {}",
            flags.pod()
        )),
        None => report.fail("no certificate controller found"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use rcgen::{CertificateParams, KeyPair};

    use crate::suite::Verdict;

    use super::*;

    /// 2026-01-01T00:00:00Z
    const NOW: i64 = 1_767_225_600;

    fn pem_expiring(year: i32, month: u8, day: u8) -> String {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["kube-apiserver".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2025, 1, 1);
        params.not_after = rcgen::date_time_ymd(year, month, day);
        params.self_signed(&key_pair).unwrap().pem()
    }

    fn secret(name: &str, type_: Option<&str>, entries: &[(&str, &[u8])]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(KUBE_SYSTEM_NAMESPACE.to_string()),
                ..Default::default()
            },
            type_: type_.map(str::to_string),
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn deployment(name: &str, ready: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(DeploymentStatus {
                ready_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn controller_manager(controllers: &str) -> ComponentFlags {
        ComponentFlags::new(
            "kube-controller-manager-cp-0",
            vec![
                "kube-controller-manager".to_string(),
                format!("--controllers={controllers}"),
            ],
        )
    }

    #[test]
    fn expiry_is_read_from_pem() {
        let pem = pem_expiring(2030, 1, 1);
        let expiry = CertificateExpiry::from_pem(pem.as_bytes()).unwrap();
        // 2030-01-01T00:00:00Z
        assert_eq!(expiry.not_after, 1_893_456_000);
        assert!(expiry.display.contains("2030"));
    }

    #[test]
    fn garbage_is_not_a_certificate() {
        assert!(CertificateExpiry::from_pem(b"not a pem").is_err());
    }

    #[test]
    fn tls_crt_is_preferred_over_other_keys() {
        let s = secret(
            "front-proxy",
            Some(TLS_SECRET_TYPE),
            &[("ca.crt", &b"ca"[..]), (TLS_CERT_KEY, &b"leaf"[..])],
        );
        assert_eq!(certificate_data(&s), Some(&b"leaf"[..]));

        let s = secret("etcd-certs", None, &[("peer.crt", &b"peer"[..]), ("peer.key", &b"k"[..])]);
        assert_eq!(certificate_data(&s), Some(&b"peer"[..]));

        let s = secret("etcd-certs", None, &[("token", &b"t"[..])]);
        assert_eq!(certificate_data(&s), None);
    }

    #[test]
    fn long_lived_certificates_and_cert_manager_pass() {
        let pem = pem_expiring(2030, 1, 1);
        let secrets = [secret(
            "apiserver-tls",
            Some(TLS_SECRET_TYPE),
            &[(TLS_CERT_KEY, pem.as_bytes())],
        )];
        let deployments = [deployment("cert-manager", 1)];
        let report = evaluate("certificate-rotation", false, NOW, &secrets, &deployments, &[]);
        assert!(report.passed(), "{:?}", report.failure_messages());
        assert_eq!(report.count(Verdict::Pass), 2);
    }

    #[test]
    fn certificate_expiring_within_a_year_fails() {
        let pem = pem_expiring(2026, 6, 1);
        let secrets = [secret(
            "webhook-cert",
            Some("Opaque"),
            &[(TLS_CERT_KEY, pem.as_bytes())],
        )];
        let cms = [controller_manager("*,bootstrapsigner,tokencleaner")];
        let report = evaluate("certificate-rotation", false, NOW, &secrets, &[], &cms);
        assert_eq!(report.count(Verdict::Fail), 1);
        assert!(report.failure_messages()[0].contains("webhook-cert"));
    }

    #[test]
    fn unparsable_and_unrelated_secrets_leave_nothing_checked() {
        let secrets = [
            secret("broken-cert", None, &[(TLS_CERT_KEY, &b"garbage"[..])]),
            secret("bootstrap-token-abcdef", None, &[("token-id", &b"abcdef"[..])]),
        ];
        let report = evaluate(
            "certificate-rotation",
            false,
            NOW,
            &secrets,
            &[deployment("cert-manager", 1)],
            &[],
        );
        assert_eq!(report.count(Verdict::Warn), 1);
        assert!(report.failure_messages()[0].contains("no certificates found"));
    }

    #[test]
    fn controller_must_be_ready_or_built_in() {
        let pem = pem_expiring(2030, 1, 1);
        let secrets = [secret("apiserver-tls", Some(TLS_SECRET_TYPE), &[(TLS_CERT_KEY, pem.as_bytes())])];

        let scaled_down = [deployment("cert-manager", 0)];
        let report = evaluate("c", false, NOW, &secrets, &scaled_down, &[]);
        assert_eq!(report.failure_messages(), vec!["no certificate controller found"]);

        let cms = [controller_manager("csrsigning,certificatesigningrequest-cleaner")];
        let report = evaluate("c", false, NOW, &secrets, &scaled_down, &cms);
        assert!(report.passed());

        let cms = [controller_manager("-csrsigning,bootstrapsigner")];
        let report = evaluate("c", false, NOW, &secrets, &[], &cms);
        assert!(!report.passed());
    }

    #[test]
    fn kind_is_skipped() {
        let report = evaluate("certificate-rotation", true, NOW, &[], &[], &[]);
        assert!(report.passed());
        assert_eq!(report.count(Verdict::Warn), 1);
    }
}
