//! Check execution and reporting
//!
//! A [`Suite`] runs checks one after another, records a [`CheckResult`] for
//! each and summarizes the run. Progress is reported through an explicit
//! [`ProgressReporter`] handed in via the [`CheckContext`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use kube::Client;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use kaas_common::error::UNKNOWN_CONTEXT;
use kaas_common::Error;

use crate::config::SuiteConfig;

/// File name of the persisted summary under the results directory
pub const REPORT_FILE_NAME: &str = "report.json";

/// Severity of a single finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Requirement met
    Pass,
    /// Not a failure, but worth a look
    Warn,
    /// Requirement violated
    Fail,
}

/// One line of check output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Severity
    pub verdict: Verdict,
    /// Human-readable description
    pub message: String,
}

/// Findings collected by one check
///
/// Every finding is logged as it is recorded, at info, warn or error level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    check: String,
    findings: Vec<Finding>,
}

impl CheckReport {
    /// Start an empty report for `check`
    pub fn new(check: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            findings: Vec::new(),
        }
    }

    /// Record a passing finding
    pub fn pass(&mut self, message: impl Into<String>) {
        self.push(Verdict::Pass, message.into());
    }

    /// Record a warning
    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(Verdict::Warn, message.into());
    }

    /// Record a failure
    pub fn fail(&mut self, message: impl Into<String>) {
        self.push(Verdict::Fail, message.into());
    }

    /// Record a pass or a failure depending on `ok`
    pub fn expect(&mut self, ok: bool, pass: impl Into<String>, fail: impl Into<String>) {
        if ok {
            self.pass(pass);
        } else {
            self.fail(fail);
        }
    }

    fn push(&mut self, verdict: Verdict, message: String) {
        match verdict {
            Verdict::Pass => info!(check = %self.check, "{message}"),
            Verdict::Warn => warn!(check = %self.check, "{message}"),
            Verdict::Fail => error!(check = %self.check, "{message}"),
        }
        self.findings.push(Finding { verdict, message });
    }

    /// Name of the check the report belongs to
    pub fn check(&self) -> &str {
        &self.check
    }

    /// All findings in recording order
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Number of findings with the given verdict
    pub fn count(&self, verdict: Verdict) -> usize {
        self.findings
            .iter()
            .filter(|f| f.verdict == verdict)
            .count()
    }

    /// A report passes iff it holds no failure
    pub fn passed(&self) -> bool {
        self.count(Verdict::Fail) == 0
    }

    /// Messages of every failing finding
    pub fn failure_messages(&self) -> Vec<&str> {
        self.findings
            .iter()
            .filter(|f| f.verdict == Verdict::Fail)
            .map(|f| f.message.as_str())
            .collect()
    }
}

/// Receives start/stop notifications for each check
pub trait ProgressReporter: Send + Sync {
    /// A check is about to run
    fn start_check(&self, name: &str, index: usize, total: usize);
    /// A check finished
    fn stop_check(&self, result: &CheckResult);
}

/// Reports progress as tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgressReporter;

impl ProgressReporter for LogProgressReporter {
    fn start_check(&self, name: &str, index: usize, total: usize) {
        info!(check = name, "[{}/{}] Running {}", index + 1, total, name);
    }

    fn stop_check(&self, result: &CheckResult) {
        let status = if result.passed { "passed" } else { "failed" };
        info!(
            check = %result.name,
            duration_secs = result.duration.as_secs_f64(),
            "{} {}",
            result.name,
            status
        );
    }
}

/// Everything a check needs to talk to the cluster
#[derive(Clone)]
pub struct CheckContext {
    /// Cluster client
    pub client: Client,
    /// Run settings
    pub config: SuiteConfig,
    /// Progress sink
    pub reporter: Arc<dyn ProgressReporter>,
    /// Identifier of this run
    pub run_id: String,
}

/// A single conformance check
#[async_trait]
pub trait Check: Send + Sync {
    /// Stable kebab-case name used for selection and reporting
    fn name(&self) -> &'static str;

    /// One-line description
    fn description(&self) -> &'static str;

    /// Inspect the cluster and collect findings
    ///
    /// Returns `Err` only when the check cannot reach a verdict at all
    /// (e.g. listing a resource failed).
    async fn run(&self, ctx: &CheckContext) -> Result<CheckReport, Error>;
}

/// Outcome of one check within a run
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// No failure finding and no error
    pub passed: bool,
    /// Wall-clock time spent in the check
    #[serde(rename = "duration_secs", serialize_with = "serialize_secs")]
    pub duration: Duration,
    /// Number of passing findings
    pub passes: usize,
    /// Number of warnings
    pub warnings: usize,
    /// Number of failing findings
    pub failures: usize,
    /// Error or panic that stopped the check
    pub error: Option<String>,
    /// Every finding the check recorded
    pub findings: Vec<Finding>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl CheckResult {
    /// Result of a check that returned a report
    pub fn from_report(report: CheckReport, duration: Duration) -> Self {
        Self {
            name: report.check().to_string(),
            passed: report.passed(),
            duration,
            passes: report.count(Verdict::Pass),
            warnings: report.count(Verdict::Warn),
            failures: report.count(Verdict::Fail),
            error: None,
            findings: report.findings,
        }
    }

    /// Result of a check that errored or panicked
    pub fn from_error(name: &str, error: String, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            duration,
            passes: 0,
            warnings: 0,
            failures: 0,
            error: Some(error),
            findings: Vec::new(),
        }
    }
}

/// Aggregate outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct SuiteSummary {
    /// Suite name
    pub suite: String,
    /// Identifier of the run
    pub run_id: String,
    /// Checks that passed
    pub passed: usize,
    /// Checks that failed
    pub failed: usize,
    /// Per-check results in execution order
    pub results: Vec<CheckResult>,
}

impl SuiteSummary {
    /// Whether every check passed
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    /// Names of failed checks
    pub fn failed_checks(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Persist the summary as `report.json` under `dir`
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf, Error> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::io(dir.display().to_string(), e.to_string()))?;
        let path = dir.join(REPORT_FILE_NAME);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::internal_with_context("report", e.to_string()))?;
        std::fs::write(&path, json)
            .map_err(|e| Error::io(path.display().to_string(), e.to_string()))?;
        Ok(path)
    }
}

/// Runs checks and records their results
pub struct Suite {
    name: String,
    run_id: String,
    results: Mutex<Vec<CheckResult>>,
}

impl Suite {
    /// Create an empty suite
    pub fn new(name: &str, run_id: &str) -> Self {
        Self {
            name: name.to_string(),
            run_id: run_id.to_string(),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Run every check in order
    ///
    /// A check that errors or panics is recorded as failed and the run moves
    /// on to the next one.
    pub async fn run(&self, checks: &[Box<dyn Check>], ctx: &CheckContext) {
        let total = checks.len();
        for (index, check) in checks.iter().enumerate() {
            ctx.reporter.start_check(check.name(), index, total);
            let span = info_span!("check", check = check.name(), run_id = %ctx.run_id);
            let result = run_guarded(check.name(), check.run(ctx))
                .instrument(span)
                .await;
            ctx.reporter.stop_check(&result);
            self.record(result);
        }
    }

    /// Record an externally produced result
    pub fn record(&self, result: CheckResult) {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(result);
    }

    /// Log a PASS/FAIL table and return the summary
    pub fn finish(&self) -> SuiteSummary {
        let results = self
            .results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let total_duration: Duration = results.iter().map(|r| r.duration).sum();
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = results.len() - passed;

        info!("========================================");
        info!("  {}", self.name.to_uppercase());
        info!("========================================");
        for r in &results {
            let tag = if r.passed { "PASS" } else { "FAIL" };
            info!("  {tag}  {:40} {:.1}s", r.name, r.duration.as_secs_f64());
            if let Some(ref e) = r.error {
                info!("        -> {}", truncate(e, 200));
            }
            for f in r.findings.iter().filter(|f| f.verdict == Verdict::Fail) {
                info!("        -> {}", truncate(&f.message, 200));
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({:.1}s total)",
            passed,
            failed,
            total_duration.as_secs_f64()
        );
        info!("========================================");

        SuiteSummary {
            suite: self.name.clone(),
            run_id: self.run_id.clone(),
            passed,
            failed,
            results,
        }
    }
}

/// Drive one check to completion, turning errors and panics into failed results
async fn run_guarded<F>(name: &str, check: F) -> CheckResult
where
    F: Future<Output = Result<CheckReport, Error>>,
{
    let start = Instant::now();
    let outcome = AssertUnwindSafe(check).catch_unwind().await;
    let duration = start.elapsed();

    match outcome {
        Ok(Ok(report)) => CheckResult::from_report(report, duration),
        Ok(Err(e)) => {
            error!(
                check = name,
                error = %e,
                context = e.context().unwrap_or(UNKNOWN_CONTEXT),
                "Check could not complete"
            );
            CheckResult::from_error(name, e.to_string(), duration)
        }
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!(check = name, panic = %msg, "Check panicked");
            CheckResult::from_error(name, format!("PANIC: {msg}"), duration)
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
