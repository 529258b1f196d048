//! kaas-conformance - runs the cluster hardening checks from inside a plugin pod

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, info_span, Instrument};

use kaas_common::kube_utils::{create_client_with_timeout, ClientSource};
use kaas_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use kaas_conformance::checks;
use kaas_conformance::config::{generate_run_id, DevelopmentMode, SuiteConfig};
use kaas_conformance::suite::{Check, CheckContext, LogProgressReporter, Suite};
use kaas_conformance::SUITE_NAME;

/// Kubernetes cluster hardening conformance checks
#[derive(Parser, Debug)]
#[command(name = "kaas-conformance", version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Log output format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the checks against the cluster (default)
    Run(RunArgs),

    /// Print every check name and description
    List,
}

/// Arguments for a check run
#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Directory for harvested node data and report.json
    #[arg(
        long,
        env = "RESULTS_DIR",
        default_value = kaas_common::DEFAULT_RESULTS_DIR
    )]
    results_dir: PathBuf,

    /// Kubeconfig to use instead of the in-cluster service account
    #[arg(long, env = "KUBECONFIG_PATH")]
    kubeconfig: Option<PathBuf>,

    /// How to reach the cluster: empty for in-cluster, or usecluster
    #[arg(long, env = "DEVELOPMENT_MODE", default_value = "")]
    development_mode: String,

    /// Prefix for the run identifier attached to log lines
    #[arg(long, env = "NS_PREFIX", default_value = "")]
    namespace_prefix: String,

    /// Deadline for each port probe, in seconds
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value = "5")]
    connect_timeout_secs: u64,

    /// Deadline for each node proxy request, in seconds
    #[arg(long, env = "PROXY_TIMEOUT_SECS", default_value = "30")]
    proxy_timeout_secs: u64,

    /// In-flight request limit to test against (default: nodes x 250)
    #[arg(long, env = "MAX_REQUESTS_INFLIGHT")]
    max_requests_inflight: Option<usize>,

    /// In-flight mutating request limit to test against (default: nodes x 50)
    #[arg(long, env = "MAX_MUTATING_REQUESTS_INFLIGHT")]
    max_mutating_requests_inflight: Option<usize>,

    /// Expected --min-request-timeout of the API server, in seconds
    #[arg(long, env = "MIN_REQUEST_TIMEOUT", default_value = "1")]
    min_request_timeout_secs: u64,

    /// Run only these checks (repeatable)
    #[arg(long = "check")]
    only: Vec<String>,

    /// Skip these checks (repeatable)
    #[arg(long = "skip")]
    skip: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    match cli.command {
        Some(Commands::List) => {
            for check in checks::all() {
                println!("{:32} {}", check.name(), check.description());
            }
            Ok(())
        }
        Some(Commands::Run(args)) => run(args).await,
        None => run(cli.run).await,
    }
}

/// Run the selected checks and exit non-zero if any failed
async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mode: DevelopmentMode = args.development_mode.parse()?;
    let config = SuiteConfig {
        results_dir: args.results_dir,
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        proxy_timeout: Duration::from_secs(args.proxy_timeout_secs),
        max_requests_inflight: args.max_requests_inflight,
        max_mutating_requests_inflight: args.max_mutating_requests_inflight,
        min_request_timeout: Duration::from_secs(args.min_request_timeout_secs),
    };
    config.validate()?;

    let selected = checks::select(checks::all(), &args.only, &args.skip)?;
    let run_id = generate_run_id(&args.namespace_prefix);

    let source = mode.client_source(args.kubeconfig);
    let span = info_span!("suite", run_id = %run_id);
    execute(source, config, selected, run_id).instrument(span).await
}

async fn execute(
    source: ClientSource,
    config: SuiteConfig,
    selected: Vec<Box<dyn Check>>,
    run_id: String,
) -> anyhow::Result<()> {
    info!(?source, checks = selected.len(), "Starting conformance run");

    let client =
        create_client_with_timeout(&source, config.connect_timeout, config.proxy_timeout).await?;

    let ctx = CheckContext {
        client,
        config: config.clone(),
        reporter: Arc::new(LogProgressReporter),
        run_id: run_id.clone(),
    };

    let suite = Suite::new(SUITE_NAME, &run_id);
    suite.run(&selected, &ctx).await;
    let summary = suite.finish();

    match summary.write_json(&config.results_dir) {
        Ok(path) => info!(path = %path.display(), "Wrote report"),
        Err(e) => error!(error = %e, "Failed to write report"),
    }

    if !summary.success() {
        anyhow::bail!(
            "{} check(s) failed: {}",
            summary.failed,
            summary.failed_checks().join(", ")
        );
    }
    Ok(())
}
