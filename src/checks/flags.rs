//! Command-line flags of control-plane static pods
//!
//! kube-apiserver, etcd and kube-controller-manager all parse their flags
//! with pflag: a repeated scalar flag keeps its last value, and repeated list
//! flags accumulate. [`ComponentFlags`] reads them the same way.

use k8s_openapi::api::core::v1::Pod;

use kaas_common::kube_utils::display_name;

/// Flags of one control-plane pod, collected from every container's
/// `command` followed by its `args`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentFlags {
    pod: String,
    args: Vec<String>,
}

impl ComponentFlags {
    /// Collect the flags of `pod`
    pub fn from_pod(pod: &Pod) -> Self {
        let args = pod
            .spec
            .iter()
            .flat_map(|spec| &spec.containers)
            .flat_map(|c| c.command.iter().flatten().chain(c.args.iter().flatten()))
            .cloned()
            .collect();
        Self::new(display_name(&pod.metadata), args)
    }

    /// Build from a pod name and raw arguments
    pub fn new(pod: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            pod: pod.into(),
            args,
        }
    }

    /// Name of the pod the flags came from
    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Every value given for `flag`, in command-line order
    ///
    /// Accepts both `--flag=value` and `--flag value`.
    pub fn values(&self, flag: &str) -> Vec<&str> {
        let mut found = Vec::new();
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            let Some(rest) = arg.strip_prefix(flag) else {
                continue;
            };
            if let Some(value) = rest.strip_prefix('=') {
                found.push(value);
            } else if rest.is_empty() {
                if let Some(value) = args.next() {
                    found.push(value.as_str());
                }
            }
        }
        found
    }

    /// Effective value of a scalar `flag`: the last one given
    pub fn value(&self, flag: &str) -> Option<&str> {
        self.values(flag).pop()
    }

    /// Whether `flag` is set at all
    pub fn has(&self, flag: &str) -> bool {
        !self.values(flag).is_empty()
    }

    /// Comma-separated values of a list `flag` across every occurrence,
    /// trimmed, empty entries dropped
    pub fn list(&self, flag: &str) -> Option<Vec<&str>> {
        let values = self.values(flag);
        if values.is_empty() {
            return None;
        }
        Some(
            values
                .into_iter()
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn pod(name: &str, command: &[&str], container_args: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "kube-apiserver".to_string(),
                    command: Some(args(command)),
                    args: Some(args(container_args)),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn flags_come_from_command_and_args() {
        let p = pod(
            "kube-apiserver-cp-0",
            &["kube-apiserver"],
            &["--authorization-mode=Node,RBAC"],
        );
        let flags = ComponentFlags::from_pod(&p);
        assert_eq!(flags.pod(), "kube-apiserver-cp-0");
        assert_eq!(flags.list("--authorization-mode"), Some(vec!["Node", "RBAC"]));
    }

    #[test]
    fn space_separated_values_are_understood() {
        let flags = ComponentFlags::new("p", args(&["--etcd-servers", "https://10.0.0.9:2379"]));
        assert_eq!(flags.value("--etcd-servers"), Some("https://10.0.0.9:2379"));
    }

    #[test]
    fn flag_prefixes_do_not_match_longer_flags() {
        let flags = ComponentFlags::new("p", args(&["--etcd-servers-overrides=/events#x"]));
        assert_eq!(flags.value("--etcd-servers"), None);
        assert!(!flags.has("--etcd-servers"));
    }

    #[test]
    fn last_scalar_value_wins() {
        let flags = ComponentFlags::new(
            "p",
            args(&[
                "--auto-compaction-mode=revision",
                "--auto-compaction-mode",
                "periodic",
            ]),
        );
        assert_eq!(flags.value("--auto-compaction-mode"), Some("periodic"));
    }

    #[test]
    fn args_override_command() {
        let p = pod(
            "kube-apiserver-cp-0",
            &["kube-apiserver", "--etcd-cafile=/old/ca.crt"],
            &["--etcd-cafile=/etc/kubernetes/pki/etcd/ca.crt"],
        );
        let flags = ComponentFlags::from_pod(&p);
        assert_eq!(
            flags.value("--etcd-cafile"),
            Some("/etc/kubernetes/pki/etcd/ca.crt")
        );
    }

    #[test]
    fn repeated_list_flags_accumulate() {
        let flags = ComponentFlags::new(
            "p",
            args(&[
                "--enable-admission-plugins=PodSecurity",
                "--enable-admission-plugins",
                "NodeRestriction, EventRateLimit",
            ]),
        );
        assert_eq!(
            flags.list("--enable-admission-plugins"),
            Some(vec!["PodSecurity", "NodeRestriction", "EventRateLimit"])
        );
        assert_eq!(flags.list("--disable-admission-plugins"), None);
    }

    #[test]
    fn trailing_flag_without_value_is_ignored() {
        let flags = ComponentFlags::new("p", args(&["--etcd-servers"]));
        assert_eq!(flags.value("--etcd-servers"), None);
    }
}
