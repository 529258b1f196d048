//! API server request limits
//!
//! For `--max-requests-inflight` a quarter of the configured limit must be
//! served without errors, while twice the limit must be throttled at least
//! once. `--max-mutating-requests-inflight` is exercised the same way with
//! ConfigMap creations, and a deliberately slow list request checks the
//! minimum request timeout.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{info, warn};

use kaas_common::fanout::{count_failures, fan_out_try};
use kaas_common::kube_utils::{is_kind_cluster, list_node_names, list_nodes};
use kaas_common::Error;

use crate::suite::{Check, CheckContext, CheckReport};

/// Namespace the mutating load creates its ConfigMaps in
pub const LOAD_NAMESPACE: &str = "default";

/// Label marking ConfigMaps created by a load burst, valued with the run id
pub const LOAD_RUN_LABEL: &str = "kaas-conformance.io/run";

/// Padding added to every load ConfigMap
const LOAD_PAYLOAD_BYTES: usize = 1000;

/// Deadline for the deliberately slow list request
pub const SLOW_REQUEST_DEADLINE: Duration = Duration::from_millis(100);

/// Deadline for each request of a load burst
pub const LOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Request counts for both load bursts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPlan {
    /// Configured or derived in-flight limit
    pub limit: usize,
    /// Burst that must be served cleanly
    pub safe: usize,
    /// Burst that must be throttled
    pub overload: usize,
}

impl LoadPlan {
    /// Plan the bursts for `limit`
    pub fn for_limit(limit: usize) -> Self {
        Self {
            limit,
            safe: (limit / 4).max(1),
            overload: limit.saturating_mul(2),
        }
    }
}

/// The API server must enforce `--max-requests-inflight`
#[derive(Debug, Clone, Copy)]
pub struct MaxRequestsInflight;

#[async_trait]
impl Check for MaxRequestsInflight {
    fn name(&self) -> &'static str {
        "max-requests-inflight"
    }

    fn description(&self) -> &'static str {
        "API server must serve normal load and throttle requests beyond max-requests-inflight"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let nodes = list_node_names(&ctx.client).await?;
        let plan = LoadPlan::for_limit(ctx.config.requests_inflight_limit(nodes.len()));
        info!(
            nodes = nodes.len(),
            limit = plan.limit,
            "Testing API server in-flight request limit"
        );

        let safe_errors = concurrent_pod_lists(&ctx.client, plan.safe).await;
        let overload_errors = concurrent_pod_lists(&ctx.client, plan.overload).await;
        Ok(evaluate(self.name(), plan, safe_errors, overload_errors))
    }
}

/// Issue `count` simultaneous cluster-wide pod listings and count failures
pub async fn concurrent_pod_lists(client: &Client, count: usize) -> usize {
    let client = client.clone();
    let results = fan_out_try(0..count, move |_| {
        let pods: Api<Pod> = Api::all(client.clone());
        async move {
            tokio::time::timeout(LOAD_REQUEST_TIMEOUT, pods.list(&ListParams::default()))
                .await
                .map_err(|_| Error::internal_with_context("load", "request timed out"))?
                .map(|_| ())
                .map_err(Error::from)
        }
    })
    .await;
    count_failures(&results)
}

/// Whether an API error reports throttling
pub fn is_rate_limited(err: &Error) -> bool {
    if let Error::Kube {
        source: kube::Error::Api(response),
    } = err
    {
        if response.code == 429 {
            return true;
        }
    }
    let message = err.to_string().to_ascii_lowercase();
    message.contains("429") || message.contains("too many requests") || message.contains("rate limit")
}

/// Failures of one concurrent burst
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstOutcome {
    /// Requests sent
    pub requests: usize,
    /// Requests that failed for any reason
    pub errors: usize,
    /// Failed requests the API server throttled
    pub rate_limited: usize,
}

impl BurstOutcome {
    /// Tally completed fan-out results
    pub fn tally<T, R>(results: &[(T, Result<R, Error>)]) -> Self {
        Self {
            requests: results.len(),
            errors: count_failures(results),
            rate_limited: results
                .iter()
                .filter(|(_, r)| r.as_ref().is_err_and(is_rate_limited))
                .count(),
        }
    }
}

/// Request counts for the mutating bursts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutatingLoadPlan {
    /// Configured or derived mutating in-flight limit
    pub limit: usize,
    /// Burst that must be served cleanly
    pub safe: usize,
    /// Concurrent batches of `limit` creations that should be throttled
    pub batches: usize,
}

impl MutatingLoadPlan {
    /// Plan the bursts for `limit`; kind clusters get fewer batches
    pub fn for_limit(limit: usize, kind: bool) -> Self {
        Self {
            limit,
            safe: (limit / 2).max(1),
            batches: if kind { 2 } else { 5 },
        }
    }

    /// Total creations of the overload burst
    pub fn overload(&self) -> usize {
        self.limit.saturating_mul(self.batches)
    }
}

/// The API server must enforce `--max-mutating-requests-inflight`
#[derive(Debug, Clone, Copy)]
pub struct MaxMutatingRequestsInflight;

#[async_trait]
impl Check for MaxMutatingRequestsInflight {
    fn name(&self) -> &'static str {
        "max-mutating-requests-inflight"
    }

    fn description(&self) -> &'static str {
        "API server must serve normal write load and throttle writes beyond max-mutating-requests-inflight"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let nodes = list_nodes(&ctx.client).await?;
        let kind = is_kind_cluster(&nodes);
        let plan = MutatingLoadPlan::for_limit(
            ctx.config.mutating_requests_inflight_limit(nodes.len()),
            kind,
        );
        info!(
            nodes = nodes.len(),
            limit = plan.limit,
            batches = plan.batches,
            kind,
            "Testing API server in-flight mutating request limit"
        );

        let safe = concurrent_config_map_creates(&ctx.client, &ctx.run_id, plan.safe).await;
        let overload =
            concurrent_config_map_creates(&ctx.client, &ctx.run_id, plan.overload()).await;
        delete_load_config_maps(&ctx.client, &ctx.run_id).await;

        Ok(evaluate_mutating(self.name(), plan, kind, safe, overload))
    }
}

/// Create `count` ConfigMaps simultaneously, labelled with `run_id`
pub async fn concurrent_config_map_creates(
    client: &Client,
    run_id: &str,
    count: usize,
) -> BurstOutcome {
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), LOAD_NAMESPACE);
    let run_id = run_id.to_string();
    let results = fan_out_try(0..count, move |i| {
        let config_maps = config_maps.clone();
        let cm = load_config_map(&run_id, i);
        async move {
            tokio::time::timeout(
                LOAD_REQUEST_TIMEOUT,
                config_maps.create(&PostParams::default(), &cm),
            )
            .await
            .map_err(|_| Error::internal_with_context("load", "request timed out"))?
            .map(|_| ())
            .map_err(Error::from)
        }
    })
    .await;
    BurstOutcome::tally(&results)
}

fn load_config_map(run_id: &str, index: usize) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            generate_name: Some(format!("kaas-load-{index}-")),
            labels: Some(BTreeMap::from([(
                LOAD_RUN_LABEL.to_string(),
                run_id.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("test".to_string(), format!("data-{index}")),
            ("load".to_string(), "x".repeat(LOAD_PAYLOAD_BYTES)),
        ])),
        ..Default::default()
    }
}

/// Remove every ConfigMap a load burst of `run_id` created
async fn delete_load_config_maps(client: &Client, run_id: &str) {
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), LOAD_NAMESPACE);
    let selector = format!("{LOAD_RUN_LABEL}={run_id}");
    if let Err(e) = config_maps
        .delete_collection(&DeleteParams::default(), &ListParams::default().labels(&selector))
        .await
    {
        warn!(error = %e, selector, "Failed to clean up load ConfigMaps");
    }
}

/// Findings for the two mutating bursts
pub fn evaluate_mutating(
    check: &str,
    plan: MutatingLoadPlan,
    kind: bool,
    safe: BurstOutcome,
    overload: BurstOutcome,
) -> CheckReport {
    let mut report = CheckReport::new(check);
    report.expect(
        safe.errors == 0,
        format!(
            "{} concurrent writes (50% of limit {}) all succeeded",
            safe.requests, plan.limit
        ),
        format!(
            "{} of {} concurrent writes failed although they were within limit {}",
            safe.errors, safe.requests, plan.limit
        ),
    );

    if overload.rate_limited > 0 {
        report.pass(format!(
            "{} of {} concurrent writes were throttled beyond limit {}",
            overload.rate_limited, overload.requests, plan.limit
        ));
    } else if kind {
        report.warn(format!(
            "no write of {} was throttled; accepted on kind cluster",
            overload.requests
        ));
    } else {
        report.fail(format!(
            "no write of {} was throttled beyond limit {} ({} failed otherwise)",
            overload.requests, plan.limit, overload.errors
        ));
    }
    report
}

/// Timing of the deliberately slow list request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTiming {
    /// The request returned a response before its deadline
    pub completed: bool,
    /// Time until the response or the deadline
    pub elapsed: Duration,
}

/// A slow list request must not be answered faster than the API server's
/// minimum request timeout
#[derive(Debug, Clone, Copy)]
pub struct MinRequestTimeout;

#[async_trait]
impl Check for MinRequestTimeout {
    fn name(&self) -> &'static str {
        "min-request-timeout"
    }

    fn description(&self) -> &'static str {
        "API server must honour min-request-timeout for slow list requests"
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error> {
        let kind = is_kind_cluster(&list_nodes(&ctx.client).await?);
        let timing = slow_pod_list(&ctx.client).await;
        info!(
            completed = timing.completed,
            elapsed_ms = timing.elapsed.as_millis() as u64,
            "Slow list request finished"
        );
        Ok(evaluate_min_request_timeout(
            self.name(),
            kind,
            ctx.config.min_request_timeout,
            timing,
        ))
    }
}

/// Field selector excluding a hundred names to make the list expensive
pub fn complex_field_selector() -> String {
    (0..100)
        .map(|i| format!("metadata.name!={i}"))
        .collect::<Vec<_>>()
        .join(",")
}

async fn slow_pod_list(client: &Client) -> RequestTiming {
    let pods: Api<Pod> = Api::namespaced(client.clone(), LOAD_NAMESPACE);
    let params = ListParams::default().fields(&complex_field_selector());
    let start = Instant::now();
    let result = tokio::time::timeout(SLOW_REQUEST_DEADLINE, pods.list(&params)).await;
    RequestTiming {
        completed: matches!(result, Ok(Ok(_))),
        elapsed: start.elapsed(),
    }
}

/// Findings for the slow list request
pub fn evaluate_min_request_timeout(
    check: &str,
    kind: bool,
    min_request_timeout: Duration,
    timing: RequestTiming,
) -> CheckReport {
    let mut report = CheckReport::new(check);
    let elapsed = timing.elapsed.as_secs_f64();
    if kind {
        report.warn(format!(
            "skipped on kind cluster: slow request finished in {elapsed:.3}s"
        ));
    } else if timing.completed && timing.elapsed < min_request_timeout {
        report.fail(format!(
            "slow request completed in {elapsed:.3}s, faster than the minimum timeout of {}s",
            min_request_timeout.as_secs_f64()
        ));
    } else {
        report.pass(format!("slow request finished as expected in {elapsed:.3}s"));
    }
    report
}

/// Findings for the two bursts
pub fn evaluate(
    check: &str,
    plan: LoadPlan,
    safe_errors: usize,
    overload_errors: usize,
) -> CheckReport {
    let mut report = CheckReport::new(check);
    report.expect(
        safe_errors == 0,
        format!(
            "{} concurrent requests (25% of limit {}) all succeeded",
            plan.safe, plan.limit
        ),
        format!(
            "{safe_errors} of {} concurrent requests failed although they were within limit {}",
            plan.safe, plan.limit
        ),
    );
    report.expect(
        overload_errors > 0,
        format!(
            "{overload_errors} of {} concurrent requests were rejected beyond limit {}",
            plan.overload, plan.limit
        ),
        format!(
            "all {} concurrent requests succeeded; expected throttling beyond limit {}",
            plan.overload, plan.limit
        ),
    );
    report
}
