//! Background execution of ingest runs.
//!
//! [`IngestRunner::submit`] creates a run and spawns its execution on a tokio
//! task, returning the `PENDING` run immediately. Execution moves the run to
//! `RUNNING`, hands it to an [`IngestExecutor`], and records the outcome as
//! `SUCCEEDED` (with the report URI) or `FAILED` (with the error message).
//! A panicking executor fails the run like an error does. At most
//! `max_concurrent` runs execute at once; the rest wait in `PENDING`.

use std::any::Any;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chess_core::IngestConfig;
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::dto::CreateIngestRequest;
use crate::error::IngestRunError;
use crate::model::{IngestRun, RunStatus};
use crate::tracker::IngestRunTracker;

// ── Executor ─────────────────────────────────────────────────────────

/// What a finished ingest produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub report_uri: Option<String>,
}

/// The actual ingestion work for one run.
#[async_trait]
pub trait IngestExecutor: Send + Sync {
    /// Process `run` (in `RUNNING` status). An error fails the run with the
    /// error's message.
    async fn execute(&self, run: &IngestRun) -> anyhow::Result<IngestReport>;
}

/// Uniform random delay in `[min, max)` milliseconds.
#[derive(Debug, Clone)]
pub struct DelaySupplier {
    range_ms: Range<u64>,
}

impl DelaySupplier {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            range_ms: min_ms..max_ms.max(min_ms),
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(config.delay_min_ms, config.delay_max_ms)
    }

    pub fn next_delay(&self) -> Duration {
        let ms = if self.range_ms.is_empty() {
            self.range_ms.start
        } else {
            rand::thread_rng().gen_range(self.range_ms.clone())
        };
        Duration::from_millis(ms)
    }
}

impl Default for DelaySupplier {
    fn default() -> Self {
        Self::new(50, 150)
    }
}

/// Stand-in executor: waits for a simulated processing delay and reports
/// `{report_prefix}/{run_id}/report.json`.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    delay: DelaySupplier,
    report_prefix: String,
}

impl SimulatedExecutor {
    pub fn new(delay: DelaySupplier, report_prefix: impl Into<String>) -> Self {
        Self {
            delay,
            report_prefix: report_prefix.into(),
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(DelaySupplier::from_config(config), config.report_prefix.clone())
    }

    pub fn report_uri(&self, id: Uuid) -> String {
        format!("{}/{}/report.json", self.report_prefix.trim_end_matches('/'), id)
    }
}

#[async_trait]
impl IngestExecutor for SimulatedExecutor {
    async fn execute(&self, run: &IngestRun) -> anyhow::Result<IngestReport> {
        tokio::time::sleep(self.delay.next_delay()).await;
        Ok(IngestReport {
            report_uri: Some(self.report_uri(run.id)),
        })
    }
}

// ── Counters ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
    total_duration_ms: AtomicU64,
    last_duration_ms: AtomicU64,
}

impl Counters {
    fn record_duration(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
        self.last_duration_ms.store(ms, Ordering::Relaxed);
    }
}

/// Holds one unit of the `active` gauge until dropped.
struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicU64) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the runner's counters.
///
/// Durations cover the executor call only, summed over every finished run
/// and for the most recent one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub active: u64,
    pub total_duration_ms: u64,
    pub last_duration_ms: u64,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

// ── Runner ───────────────────────────────────────────────────────────

/// Runs allowed to execute at once unless configured otherwise.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// A run accepted by [`IngestRunner::submit`] and the task executing it.
#[derive(Debug)]
pub struct Submission {
    pub run: IngestRun,
    pub handle: JoinHandle<Result<IngestRun, IngestRunError>>,
}

#[derive(Clone)]
pub struct IngestRunner {
    tracker: Arc<IngestRunTracker>,
    executor: Arc<dyn IngestExecutor>,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl IngestRunner {
    pub fn new(tracker: Arc<IngestRunTracker>, executor: Arc<dyn IngestExecutor>) -> Self {
        Self {
            tracker,
            executor,
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Let at most `limit` runs (minimum 1) execute at the same time.
    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    pub fn tracker(&self) -> &Arc<IngestRunTracker> {
        &self.tracker
    }

    /// Create a run and execute it in the background.
    pub async fn submit(&self, request: CreateIngestRequest) -> Result<Submission, IngestRunError> {
        let run = self.tracker.create_from_request(request).await?;
        let id = run.id;

        let runner = self.clone();
        let span = info_span!("ingest_run", run_id = %id, dataset_id = %run.dataset_id);
        let handle = tokio::spawn(async move { runner.execute(id).await }.instrument(span));

        Ok(Submission { run, handle })
    }

    /// Drive a `PENDING` run to a terminal status.
    ///
    /// Waits for an execution permit first. Returns the terminal run. An
    /// executor error or panic is not an `Err` here: it is recorded on the
    /// run as `FAILED`.
    pub async fn execute(&self, id: Uuid) -> Result<IngestRun, IngestRunError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("ingest permits are never closed");

        let run = self.tracker.transition(id, RunStatus::Running).await?;
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        let _active = ActiveGuard::enter(&self.counters.active);

        let start = Instant::now();
        let outcome = match AssertUnwindSafe(self.executor.execute(&run)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!("executor panicked: {}", panic_message(&*panic))),
        };
        let elapsed = start.elapsed();
        self.counters.record_duration(elapsed);
        let duration_ms = elapsed.as_millis() as u64;

        match outcome {
            Ok(report) => {
                let done = self.tracker.complete(id, report.report_uri).await?;
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(
                    run_id = %id,
                    duration_ms = duration_ms,
                    report_uri = done.report_uri.as_deref().unwrap_or("-"),
                    "ingest run succeeded"
                );
                Ok(done)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                let failed = self.tracker.fail(id, message.clone()).await?;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(run_id = %id, duration_ms = duration_ms, error = %message, "ingest run failed");
                Ok(failed)
            }
        }
    }

    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            started: self.counters.started.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
            total_duration_ms: self.counters.total_duration_ms.load(Ordering::Relaxed),
            last_duration_ms: self.counters.last_duration_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRunStore;

    use std::sync::atomic::AtomicUsize;

    struct BrokenArchive;

    #[async_trait]
    impl IngestExecutor for BrokenArchive {
        async fn execute(&self, run: &IngestRun) -> anyhow::Result<IngestReport> {
            anyhow::bail!("archive for {} unavailable", run.months[0])
        }
    }

    struct ExplodingEngine;

    #[async_trait]
    impl IngestExecutor for ExplodingEngine {
        async fn execute(&self, _run: &IngestRun) -> anyhow::Result<IngestReport> {
            panic!("engine exploded")
        }
    }

    /// Sleeps for a fixed time and records how many executions overlap.
    #[derive(Default)]
    struct Gauge {
        sleep: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl IngestExecutor for Gauge {
        async fn execute(&self, _run: &IngestRun) -> anyhow::Result<IngestReport> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.sleep).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(IngestReport::default())
        }
    }

    fn request(user: &str) -> CreateIngestRequest {
        CreateIngestRequest {
            user: user.to_string(),
            months: vec!["2024-10".to_string(), "2024-11".to_string()],
            dataset_id: "ds-1".to_string(),
            note: String::new(),
        }
    }

    fn runner(executor: Arc<dyn IngestExecutor>) -> IngestRunner {
        let tracker = Arc::new(IngestRunTracker::with_store(Arc::new(MemoryRunStore::new())));
        IngestRunner::new(tracker, executor)
    }

    #[test]
    fn test_delay_supplier_bounds() {
        let delay = DelaySupplier::new(50, 150);
        for _ in 0..100 {
            let d = delay.next_delay();
            assert!(d >= Duration::from_millis(50) && d < Duration::from_millis(150));
        }
        assert_eq!(DelaySupplier::new(0, 0).next_delay(), Duration::ZERO);
        assert_eq!(DelaySupplier::new(30, 10).next_delay(), Duration::from_millis(30));
    }

    #[test]
    fn test_report_uri_format() {
        let exec = SimulatedExecutor::new(DelaySupplier::new(0, 0), "s3://reports/ingest/");
        let id = Uuid::nil();
        assert_eq!(
            exec.report_uri(id),
            "s3://reports/ingest/00000000-0000-0000-0000-000000000000/report.json"
        );
    }

    #[tokio::test]
    async fn test_submit_runs_to_success() {
        let exec = SimulatedExecutor::new(DelaySupplier::new(0, 0), "s3://reports/ingest");
        let runner = runner(Arc::new(exec));

        let submission = runner.submit(request("nodirbek")).await.unwrap();
        assert_eq!(submission.run.status, RunStatus::Pending);

        let done = submission.handle.await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(
            done.report_uri,
            Some(format!("s3://reports/ingest/{}/report.json", done.id))
        );
        assert_eq!(runner.tracker().get(done.id).unwrap(), done);

        let stats = runner.stats();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_executor_error_fails_run() {
        let runner = runner(Arc::new(BrokenArchive));
        let submission = runner.submit(request("gukesh")).await.unwrap();

        let failed = submission.handle.await.unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("archive for 2024-10 unavailable"));
        assert!(failed.report_uri.is_none());
        assert_eq!(runner.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_execute_twice_is_rejected() {
        let exec = SimulatedExecutor::new(DelaySupplier::new(0, 0), "s3://r");
        let runner = runner(Arc::new(exec));
        let run = runner.tracker().create_from_request(request("pragg")).await.unwrap();

        runner.execute(run.id).await.unwrap();
        let err = runner.execute(run.id).await.unwrap_err();
        assert!(matches!(
            err,
            IngestRunError::InvalidTransition { from: RunStatus::Succeeded, .. }
        ));
        assert_eq!(runner.stats().started, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_request() {
        let runner = runner(Arc::new(BrokenArchive));
        let mut bad = request("x");
        bad.months.clear();
        let err = runner.submit(bad).await.unwrap_err();
        assert!(matches!(err, IngestRunError::Validation(_)));
        assert!(runner.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_executor_panic_fails_run() {
        let runner = runner(Arc::new(ExplodingEngine));
        let submission = runner.submit(request("wesley")).await.unwrap();

        let failed = submission.handle.await.unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("executor panicked: engine exploded"));
        assert_eq!(runner.tracker().get(failed.id).unwrap().status, RunStatus::Failed);

        let stats = runner.stats();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_executions_are_bounded() {
        let gauge = Arc::new(Gauge {
            sleep: Duration::from_millis(10),
            ..Gauge::default()
        });
        let runner = runner(gauge.clone()).with_max_concurrent(2);

        let mut handles = Vec::new();
        for user in ["a", "b", "c", "d", "e", "f"] {
            handles.push(runner.submit(request(user)).await.unwrap().handle);
        }
        for handle in handles {
            let done = handle.await.unwrap().unwrap();
            assert_eq!(done.status, RunStatus::Succeeded);
        }

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        assert_eq!(runner.stats().succeeded, 6);
        assert_eq!(runner.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_record_durations() {
        let gauge = Arc::new(Gauge {
            sleep: Duration::from_millis(40),
            ..Gauge::default()
        });
        let runner = runner(gauge);

        for user in ["levon", "teimour"] {
            let submission = runner.submit(request(user)).await.unwrap();
            submission.handle.await.unwrap().unwrap();
        }

        let stats = runner.stats();
        assert!(stats.last_duration_ms >= 40);
        assert!(stats.total_duration_ms >= 80);
        assert!(stats.total_duration_ms >= stats.last_duration_ms);
    }
}
