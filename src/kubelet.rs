//! Kubelet configuration snapshots read back from harvested `configz` files

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use kaas_common::error::ReadStage;
use kaas_common::Error;

/// Name of the kubelet's configuration introspection endpoint
pub const CONFIGZ_ENDPOINT: &str = "configz";

/// Well-known kubelet read-only port
pub const KUBELET_READ_ONLY_PORT: u16 = 10255;

/// Authorization mode the kubelet must delegate to the API server with
pub const WEBHOOK_AUTHORIZATION_MODE: &str = "Webhook";

/// Parsed view of a kubelet `/configz` response
///
/// Only the fields the hardening checks look at are modelled. The
/// `kubeletconfig` wrapper is mandatory; everything inside it is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KubeletConfigSnapshot {
    #[serde(rename = "kubeletconfig")]
    kubelet_config: KubeletConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfiguration {
    #[serde(default)]
    read_only_port: Option<u16>,
    #[serde(default)]
    authentication: KubeletAuthentication,
    #[serde(default)]
    authorization: KubeletAuthorization,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct KubeletAuthentication {
    #[serde(default)]
    anonymous: KubeletAnonymousAuthentication,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct KubeletAnonymousAuthentication {
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct KubeletAuthorization {
    #[serde(default)]
    mode: Option<String>,
}

impl KubeletConfigSnapshot {
    /// Read and parse a persisted configz file
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        debug!(path = %path.display(), "Reading kubelet config");
        let display = path.display().to_string();

        let mut file = File::open(path)
            .map_err(|e| Error::kubelet_config(&display, ReadStage::Open, e.to_string()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::kubelet_config(&display, ReadStage::Read, e.to_string()))?;

        Self::from_slice(&bytes)
            .map_err(|e| Error::kubelet_config(&display, ReadStage::Parse, e.to_string()))
    }

    /// Parse configz JSON from memory
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Configured read-only port, if the field is present
    pub fn read_only_port(&self) -> Option<u16> {
        self.kubelet_config.read_only_port
    }

    /// Whether anonymous authentication is enabled, if the field is present
    pub fn anonymous_auth_enabled(&self) -> Option<bool> {
        self.kubelet_config.authentication.anonymous.enabled
    }

    /// Configured authorization mode, if present
    pub fn authorization_mode(&self) -> Option<&str> {
        self.kubelet_config.authorization.mode.as_deref()
    }

    /// The read-only port is off: field absent or zero
    pub fn read_only_port_disabled(&self) -> bool {
        matches!(self.read_only_port(), None | Some(0))
    }

    /// Anonymous authentication is explicitly turned off
    pub fn anonymous_auth_disabled(&self) -> bool {
        self.anonymous_auth_enabled() == Some(false)
    }

    /// Authorization mode is exactly `Webhook`
    pub fn authorization_mode_is_webhook(&self) -> bool {
        self.authorization_mode() == Some(WEBHOOK_AUTHORIZATION_MODE)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const HARDENED: &str = r#"{"kubeletconfig":{"authentication":{"anonymous":{"enabled":false}},"authorization":{"mode":"Webhook"}}}"#;

    fn write_temp(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn hardened_kubelet_passes_every_predicate() {
        let file = write_temp(HARDENED.as_bytes());
        let snapshot = KubeletConfigSnapshot::from_file(file.path()).unwrap();

        assert!(snapshot.anonymous_auth_disabled());
        assert!(snapshot.authorization_mode_is_webhook());
        assert!(snapshot.read_only_port_disabled());
    }

    #[test]
    fn read_only_port_zero_counts_as_disabled() {
        let snapshot =
            KubeletConfigSnapshot::from_slice(br#"{"kubeletconfig":{"readOnlyPort":0}}"#).unwrap();
        assert_eq!(snapshot.read_only_port(), Some(0));
        assert!(snapshot.read_only_port_disabled());
    }

    #[test]
    fn read_only_port_set_counts_as_enabled() {
        let snapshot =
            KubeletConfigSnapshot::from_slice(br#"{"kubeletconfig":{"readOnlyPort":10255}}"#)
                .unwrap();
        assert_eq!(snapshot.read_only_port(), Some(KUBELET_READ_ONLY_PORT));
        assert!(!snapshot.read_only_port_disabled());
    }

    #[test]
    fn anonymous_auth_enabled_is_detected() {
        let snapshot = KubeletConfigSnapshot::from_slice(
            br#"{"kubeletconfig":{"authentication":{"anonymous":{"enabled":true}}}}"#,
        )
        .unwrap();
        assert!(!snapshot.anonymous_auth_disabled());
    }

    #[test]
    fn missing_anonymous_flag_is_not_treated_as_disabled() {
        let snapshot = KubeletConfigSnapshot::from_slice(br#"{"kubeletconfig":{}}"#).unwrap();
        assert_eq!(snapshot.anonymous_auth_enabled(), None);
        assert!(!snapshot.anonymous_auth_disabled());
        assert!(!snapshot.authorization_mode_is_webhook());
    }

    #[test]
    fn webhook_match_is_exact_and_single_valued() {
        for mode in ["AlwaysAllow", "webhook", "Webhook,RBAC", " Webhook"] {
            let json = format!(r#"{{"kubeletconfig":{{"authorization":{{"mode":"{mode}"}}}}}}"#);
            let snapshot = KubeletConfigSnapshot::from_slice(json.as_bytes()).unwrap();
            assert!(!snapshot.authorization_mode_is_webhook(), "mode {mode:?}");
        }
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let file = write_temp(b"<html>403 Forbidden</html>");
        let err = KubeletConfigSnapshot::from_file(file.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::KubeletConfig {
                stage: ReadStage::Parse,
                ..
            }
        ));
    }

    #[test]
    fn json_without_kubeletconfig_is_rejected() {
        let file = write_temp(br#"{"componentconfig":{}}"#);
        let err = KubeletConfigSnapshot::from_file(file.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::KubeletConfig {
                stage: ReadStage::Parse,
                ..
            }
        ));
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = KubeletConfigSnapshot::from_file(&dir.path().join("configz.json")).unwrap_err();
        assert!(matches!(
            err,
            Error::KubeletConfig {
                stage: ReadStage::Open,
                ..
            }
        ));
        assert!(err
            .to_string()
            .contains("failed to read/parse kubelet configuration"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let snapshot = KubeletConfigSnapshot::from_slice(
            br#"{"kubeletconfig":{"staticPodPath":"/etc/kubernetes/manifests","readOnlyPort":0,"authorization":{"mode":"Webhook","webhook":{"cacheAuthorizedTTL":"5m0s"}}}}"#,
        )
        .unwrap();
        assert!(snapshot.authorization_mode_is_webhook());
        assert!(snapshot.read_only_port_disabled());
    }
}
