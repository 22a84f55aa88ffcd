use crate::runner::patcher::PatchOutcome;
use crate::runner::scheduler::{CycleMode, CycleReport};

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};

use std::fmt::{self, Debug};

const NAMESPACE: &str = "job_reaper";
const OUTCOME: &[&str] = &["outcome"];
const MODE: &[&str] = &["mode"];

pub struct Metrics {
    registry: Registry,
    api_server_request_times: Histogram,
    cycles: IntCounterVec,
    list_errors: IntCounter,
    jobs_listed: IntGauge,
    jobs_matched: IntGauge,
    patches: IntCounterVec,
    last_successful_cycle: IntGauge,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        let request_time_opts = HistogramOpts::new(
            "api_server_request_time",
            "Total time from sending the request to receiving the response headers",
        )
        .namespace(NAMESPACE)
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, 12).unwrap());
        let api_server_request_times = Histogram::with_opts(request_time_opts).unwrap();
        registry
            .register(Box::new(api_server_request_times.clone()))
            .unwrap();

        let cycle_opts = Opts::new(
            "cycles",
            "number of reconciliation cycles started, by scheduled or forced mode",
        )
        .namespace(NAMESPACE);
        let cycles = IntCounterVec::new(cycle_opts, MODE).unwrap();
        registry.register(Box::new(cycles.clone())).unwrap();

        let list_error_opts = Opts::new(
            "list_errors",
            "number of cycles that were skipped because listing jobs failed",
        )
        .namespace(NAMESPACE);
        let list_errors = IntCounter::with_opts(list_error_opts).unwrap();
        registry.register(Box::new(list_errors.clone())).unwrap();

        let listed_opts = Opts::new("jobs_listed", "number of jobs returned by the last list")
            .namespace(NAMESPACE);
        let jobs_listed = IntGauge::with_opts(listed_opts).unwrap();
        registry.register(Box::new(jobs_listed.clone())).unwrap();

        let matched_opts = Opts::new(
            "jobs_matched",
            "number of jobs that matched the name prefix in the last cycle",
        )
        .namespace(NAMESPACE);
        let jobs_matched = IntGauge::with_opts(matched_opts).unwrap();
        registry.register(Box::new(jobs_matched.clone())).unwrap();

        let patch_opts = Opts::new("patches", "ttl patch results by outcome").namespace(NAMESPACE);
        let patches = IntCounterVec::new(patch_opts, OUTCOME).unwrap();
        registry.register(Box::new(patches.clone())).unwrap();

        let last_cycle_opts = Opts::new(
            "last_successful_cycle_timestamp_seconds",
            "unix time at which the last cycle with a successful list finished",
        )
        .namespace(NAMESPACE);
        let last_successful_cycle = IntGauge::with_opts(last_cycle_opts).unwrap();
        registry
            .register(Box::new(last_successful_cycle.clone()))
            .unwrap();

        Metrics {
            registry,
            api_server_request_times,
            cycles,
            list_errors,
            jobs_listed,
            jobs_matched,
            patches,
            last_successful_cycle,
        }
    }

    pub fn client_metrics(&self) -> ClientMetrics {
        ClientMetrics {
            api_server_request_times: self.api_server_request_times.clone(),
        }
    }

    pub fn cycle_started(&self, mode: CycleMode) {
        self.cycles.with_label_values(&[mode.as_str()]).inc();
    }

    pub fn list_failed(&self) {
        self.list_errors.inc();
    }

    pub fn cycle_finished(&self, report: &CycleReport) {
        self.jobs_listed.set(report.listed as i64);
        self.jobs_matched.set(report.matched as i64);
        self.last_successful_cycle
            .set(chrono::Utc::now().timestamp());
    }

    pub fn patch_finished(&self, outcome: Option<PatchOutcome>) {
        let label = outcome.map(PatchOutcome::as_str).unwrap_or("failed");
        self.patches.with_label_values(&[label]).inc();
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}

pub struct ClientMetrics {
    api_server_request_times: Histogram,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self) -> prometheus::HistogramTimer {
        self.api_server_request_times.start_timer()
    }
}
