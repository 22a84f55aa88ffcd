use crate::config::{ConfigError, ReaperConfig};
use crate::filter::JobFilter;
use crate::k8s_types::K8sType;
use crate::resource::ManagedObject;
use crate::runner::client::Error;
use crate::runner::lister::ResourceLister;
use crate::runner::metrics::Metrics;
use crate::runner::patcher::{PatchOutcome, PatchPolicy, TtlPatch, TtlPatcher};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Waits between cycles. Tests swap this out so that nothing actually sleeps.
#[async_trait]
pub trait Timer: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Cooperative cancellation signal shared between the scheduler, the http server, and whoever
/// holds the `ReaperHandle`. Once triggered it stays triggered.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

impl Shutdown {
    pub fn new() -> Shutdown {
        let (tx, _) = watch::channel(false);
        Shutdown { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `trigger` has been called, immediately if it already was
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let triggered = *rx.borrow();
            if triggered || rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Periodic enforcement with the long ttl
    Scheduled,
    /// On-demand cleanup with the short ttl
    Forced,
}

impl CycleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleMode::Scheduled => "scheduled",
            CycleMode::Forced => "forced",
        }
    }
}

/// Tally of one list→filter→patch pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub listed: usize,
    pub matched: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub not_found: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl CycleReport {
    fn record(&mut self, result: &Result<PatchOutcome, Error>) {
        match result {
            Ok(PatchOutcome::Applied) => self.applied += 1,
            Ok(PatchOutcome::Unchanged) => self.unchanged += 1,
            Ok(PatchOutcome::NotFound) => self.not_found += 1,
            Ok(PatchOutcome::Skipped) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }
}

impl Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "listed: {}, matched: {}, applied: {}, unchanged: {}, not_found: {}, skipped: {}, failed: {}",
            self.listed,
            self.matched,
            self.applied,
            self.unchanged,
            self.not_found,
            self.skipped,
            self.failed
        )
    }
}

/// Runs the reconciliation cycle on a fixed interval until shut down, and on demand through
/// `cleanup_now`. The two paths share nothing but the lister and patcher.
pub struct Scheduler<L, P, T> {
    lister: L,
    patcher: TtlPatcher<P>,
    timer: T,
    filter: JobFilter,
    kind: &'static K8sType,
    ttl_seconds: i64,
    forced_ttl_seconds: i64,
    interval: Duration,
    patch_concurrency: usize,
    metrics: Arc<Metrics>,
    running: AtomicBool,
}

impl<L, P, T> Scheduler<L, P, T> {
    pub fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }
}

impl<L, P, T> fmt::Debug for Scheduler<L, P, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("filter", &self.filter)
            .field("kind", &self.kind)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("forced_ttl_seconds", &self.forced_ttl_seconds)
            .field("interval", &self.interval)
            .field("state", &self.state())
            .finish()
    }
}

impl<L, P, T> Scheduler<L, P, T>
where
    L: ResourceLister,
    P: TtlPatch,
    T: Timer,
{
    /// Validates the config up front, since configuration errors are only ever fatal at startup
    pub fn new(
        config: &ReaperConfig,
        lister: L,
        patch_api: P,
        timer: T,
        metrics: Arc<Metrics>,
    ) -> Result<Scheduler<L, P, T>, ConfigError> {
        let filter = config.validate()?;
        Ok(Scheduler {
            lister,
            patcher: TtlPatcher::new(patch_api, config.job_type),
            timer,
            filter,
            kind: config.job_type,
            ttl_seconds: config.ttl_seconds,
            forced_ttl_seconds: config.forced_ttl_seconds,
            interval: config.interval,
            patch_concurrency: config.patch_concurrency,
            metrics,
            running: AtomicBool::new(false),
        })
    }

    /// Runs cycles forever, waiting `interval` between them, until `shutdown` is triggered.
    /// Shutdown is checked before each cycle and interrupts the wait, but a batch of patches that
    /// has started is always allowed to finish.
    pub async fn run(&self, shutdown: &Shutdown) {
        self.running.store(true, Ordering::SeqCst);
        log::info!(
            "Starting reaper for {} with prefix: '{}', ttl: {}s, interval: {}s",
            self.kind,
            self.filter.prefix(),
            self.ttl_seconds,
            self.interval.as_secs()
        );

        while !shutdown.is_triggered() {
            match self
                .run_cycle(self.ttl_seconds, PatchPolicy::Narrow, CycleMode::Scheduled)
                .await
            {
                Ok(report) => log::info!("Finished scheduled cycle, {}", report),
                Err(err) => log::error!(
                    "Skipping this cycle because listing {} failed: {}",
                    self.kind,
                    err
                ),
            }

            log::debug!("Next cycle in {}s", self.interval.as_secs());
            tokio::select! {
                _ = self.timer.sleep(self.interval) => {}
                _ = shutdown.wait() => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        log::info!("Reaper stopped");
    }

    /// One immediate cycle with the forced ttl, overriding whatever ttl the jobs already have
    pub async fn cleanup_now(&self) -> Result<CycleReport, Error> {
        log::info!(
            "Forcing cleanup of {} with prefix: '{}', ttl: {}s",
            self.kind,
            self.filter.prefix(),
            self.forced_ttl_seconds
        );
        let report = self
            .run_cycle(self.forced_ttl_seconds, PatchPolicy::Override, CycleMode::Forced)
            .await?;
        log::info!("Finished forced cycle, {}", report);
        Ok(report)
    }

    /// List, filter, then patch every match. A list error aborts the cycle; patch errors are
    /// logged and counted but never stop the rest of the batch.
    pub async fn run_cycle(
        &self,
        ttl_seconds: i64,
        policy: PatchPolicy,
        mode: CycleMode,
    ) -> Result<CycleReport, Error> {
        let start_time = Instant::now();
        self.metrics.cycle_started(mode);

        let objects = self.lister.list(self.kind).await.map_err(|err| {
            self.metrics.list_failed();
            err
        })?;
        let listed = objects.len();
        let matched: Vec<ManagedObject> = objects
            .into_iter()
            .filter(|o| self.filter.matches(o))
            .collect();

        let mut report = CycleReport {
            listed,
            matched: matched.len(),
            ..Default::default()
        };

        let results: Vec<Result<PatchOutcome, Error>> = stream::iter(matched)
            .map(move |object| async move {
                let result = self.patcher.patch(&object, ttl_seconds, policy).await;
                if let Err(ref err) = result {
                    log::error!(
                        "Failed to set ttl on {} '{}': {}",
                        self.kind.kind,
                        object,
                        err
                    );
                }
                result
            })
            .buffer_unordered(self.patch_concurrency)
            .collect()
            .await;

        for result in results.iter() {
            report.record(result);
            self.metrics.patch_finished(result.as_ref().ok().copied());
        }
        self.metrics.cycle_finished(&report);
        log::debug!(
            "{} cycle took {}ms",
            mode.as_str(),
            start_time.elapsed().as_millis()
        );
        Ok(report)
    }
}
