//! Shared setup for kind integration tests

use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, OnceLock};

use kube::Client;

use kaas_common::kube_utils::{create_client, ClientSource};
use kaas_conformance::config::SuiteConfig;
use kaas_conformance::suite::{CheckContext, LogProgressReporter};

/// Name of the kind cluster the tests run against
pub const TEST_CLUSTER_NAME: &str = "kaas-conformance-test";

static KUBECONFIG: OnceLock<PathBuf> = OnceLock::new();

fn run(cmd: &mut Command) -> String {
    let output = cmd.output().expect("failed to spawn command");
    assert!(
        output.status.success(),
        "{:?} failed: {}",
        cmd,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Create the kind cluster once per test binary and return its kubeconfig
fn ensure_kind_cluster() -> PathBuf {
    KUBECONFIG
        .get_or_init(|| {
            let clusters = run(Command::new("kind").args(["get", "clusters"]));
            if !clusters.lines().any(|l| l.trim() == TEST_CLUSTER_NAME) {
                run(Command::new("kind").args([
                    "create",
                    "cluster",
                    "--name",
                    TEST_CLUSTER_NAME,
                    "--wait",
                    "120s",
                ]));
            }

            let path = std::env::temp_dir().join(format!("{TEST_CLUSTER_NAME}.kubeconfig"));
            let kubeconfig = run(Command::new("kind").args([
                "get",
                "kubeconfig",
                "--name",
                TEST_CLUSTER_NAME,
            ]));
            std::fs::write(&path, kubeconfig).expect("failed to write kubeconfig");
            path
        })
        .clone()
}

/// Client for the test cluster, creating the cluster if needed
pub async fn ensure_test_cluster() -> Client {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let path = ensure_kind_cluster();
    create_client(&ClientSource::Kubeconfig(path))
        .await
        .expect("failed to create client for kind cluster")
}

/// Check context writing its results to `results_dir`
pub async fn test_context(results_dir: PathBuf) -> CheckContext {
    CheckContext {
        client: ensure_test_cluster().await,
        config: SuiteConfig {
            results_dir,
            ..Default::default()
        },
        reporter: Arc::new(LogProgressReporter),
        run_id: "kind-test".to_string(),
    }
}
