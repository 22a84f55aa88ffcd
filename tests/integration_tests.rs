use job_reaper::config::{ClientConfig, Credentials, ReaperConfig};
use job_reaper::k8s_types::{self, K8sType};
use job_reaper::resource::{ManagedObject, ObjectId, ObjectIdRef};
use job_reaper::runner::client::{Client, Error};
use job_reaper::runner::{
    ClusterLister, CycleMode, CycleReport, ListScope, Metrics, PatchPolicy, ResourceLister,
    Scheduler, SchedulerState, Shutdown, Timer, TtlPatch,
};
use job_reaper::serde_json::{json, Value};

use async_trait::async_trait;
use http::StatusCode;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static JOB: &K8sType = k8s_types::batch::v1::Job;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    let _ = env_logger::try_init();
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
        .block_on(future)
}

/// In-memory stand-in for the api server. Patches are applied to the stored jobs, so consecutive
/// cycles see the results of earlier ones. Every patch bumps the job's resourceVersion, and a
/// patch conditional on an older version fails with 409 like the real api server.
#[derive(Debug, Default)]
struct FakeCluster {
    jobs: Mutex<Vec<ManagedObject>>,
    patches: Mutex<Vec<(ObjectId, i64)>>,
    list_calls: AtomicUsize,
    fail_list: AtomicBool,
    fail_patch_for: Mutex<HashSet<String>>,
    /// triggered from inside `list`, to simulate a shutdown that arrives mid-cycle
    shutdown_on_list: Mutex<Option<Arc<Shutdown>>>,
}

impl FakeCluster {
    fn with_jobs(jobs: Vec<ManagedObject>) -> Arc<FakeCluster> {
        Arc::new(FakeCluster {
            jobs: Mutex::new(jobs),
            ..Default::default()
        })
    }

    fn patches(&self) -> Vec<(ObjectId, i64)> {
        let mut patches = self.patches.lock().unwrap().clone();
        patches.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        patches
    }

    fn ttl_of(&self, name: &str) -> Option<i64> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|job| job.name() == Some(name))
            .and_then(|job| job.ttl_seconds)
    }

    fn remove(&self, name: &str) {
        self.jobs
            .lock()
            .unwrap()
            .retain(|job| job.name() != Some(name));
    }
}

#[async_trait]
impl ResourceLister for FakeCluster {
    async fn list(&self, _kind: &K8sType) -> Result<Vec<ManagedObject>, Error> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown_on_list.lock().unwrap().as_ref() {
            shutdown.trigger();
        }
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Error::http(StatusCode::SERVICE_UNAVAILABLE));
        }
        Ok(self.jobs.lock().unwrap().clone())
    }
}

#[async_trait]
impl TtlPatch for FakeCluster {
    async fn patch_ttl(
        &self,
        _kind: &K8sType,
        id: &ObjectIdRef<'_>,
        ttl_seconds: i64,
        resource_version: Option<&str>,
    ) -> Result<(), Error> {
        if self.fail_patch_for.lock().unwrap().contains(id.name()) {
            return Err(Error::http(StatusCode::INTERNAL_SERVER_ERROR));
        }
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|job| job.name() == Some(id.name()) && job.namespace() == id.namespace());
        match job {
            Some(job)
                if resource_version.is_some() && resource_version != job.resource_version() =>
            {
                Err(Error::http(StatusCode::CONFLICT))
            }
            Some(job) => {
                let version: u64 = job
                    .resource_version()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                job.resource_version = Some((version + 1).to_string());
                job.ttl_seconds = Some(ttl_seconds);
                self.patches
                    .lock()
                    .unwrap()
                    .push((id.to_owned(), ttl_seconds));
                Ok(())
            }
            None => Err(Error::http(StatusCode::NOT_FOUND)),
        }
    }
}

/// Never actually sleeps. Records every requested duration and triggers the shutdown once it has
/// been asked to sleep `stop_after` times.
struct FakeTimer {
    sleeps: Arc<Mutex<Vec<Duration>>>,
    stop_after: usize,
    shutdown: Arc<Shutdown>,
}

impl FakeTimer {
    fn new(stop_after: usize, shutdown: Arc<Shutdown>) -> FakeTimer {
        FakeTimer {
            sleeps: Arc::new(Mutex::new(Vec::new())),
            stop_after,
            shutdown,
        }
    }
}

#[async_trait]
impl Timer for FakeTimer {
    async fn sleep(&self, duration: Duration) {
        let mut sleeps = self.sleeps.lock().unwrap();
        sleeps.push(duration);
        if sleeps.len() >= self.stop_after {
            self.shutdown.trigger();
        }
    }
}

type FakeScheduler = Scheduler<Arc<FakeCluster>, Arc<FakeCluster>, FakeTimer>;

fn scheduler(cluster: &Arc<FakeCluster>, config: ReaperConfig, timer: FakeTimer) -> FakeScheduler {
    Scheduler::new(
        &config,
        cluster.clone(),
        cluster.clone(),
        timer,
        Arc::new(Metrics::new()),
    )
    .expect("config should be valid")
}

fn scheduler_for(cluster: &Arc<FakeCluster>) -> FakeScheduler {
    scheduler(cluster, config(), idle_timer())
}

fn config() -> ReaperConfig {
    ReaperConfig::new("job-reaper-test", "scanjob-")
}

fn idle_timer() -> FakeTimer {
    FakeTimer::new(usize::MAX, Arc::new(Shutdown::new()))
}

fn scheduled_cycle(scheduler: &FakeScheduler) -> Result<CycleReport, Error> {
    block_on(scheduler.run_cycle(600, PatchPolicy::Narrow, CycleMode::Scheduled))
}

#[test]
fn only_jobs_with_the_prefix_are_patched() {
    let cluster = FakeCluster::with_jobs(vec![
        ManagedObject::new("a", "scanjob-1"),
        ManagedObject::new("a", "other-1"),
    ]);
    let scheduler = scheduler(&cluster, config(), idle_timer());

    let report = scheduled_cycle(&scheduler).unwrap();
    assert_eq!(2, report.listed);
    assert_eq!(1, report.matched);
    assert_eq!(1, report.applied);
    assert_eq!(vec![(ObjectId::new("a", "scanjob-1"), 600)], cluster.patches());
    assert_eq!(Some(600), cluster.ttl_of("scanjob-1"));
    assert_eq!(None, cluster.ttl_of("other-1"));
}

#[test]
fn second_cycle_makes_no_further_changes() {
    let cluster = FakeCluster::with_jobs(vec![
        ManagedObject::new("a", "scanjob-1"),
        ManagedObject::new("b", "scanjob-2").with_ttl_seconds(3600),
    ]);
    let scheduler = scheduler(&cluster, config(), idle_timer());

    let first = scheduled_cycle(&scheduler).unwrap();
    assert_eq!(2, first.applied);

    let second = scheduled_cycle(&scheduler).unwrap();
    assert_eq!(0, second.applied);
    assert_eq!(2, second.unchanged);
    assert_eq!(2, cluster.patches().len());
}

#[test]
fn empty_cluster_is_a_successful_no_op() {
    let cluster = FakeCluster::with_jobs(Vec::new());
    let scheduler = scheduler(&cluster, config(), idle_timer());

    let report = scheduled_cycle(&scheduler).unwrap();
    assert_eq!(CycleReport::default(), report);
    assert!(cluster.patches().is_empty());
}

#[test]
fn cleanup_now_overrides_the_steady_state_ttl() {
    let cluster =
        FakeCluster::with_jobs(vec![ManagedObject::new("a", "scanjob-1").with_ttl_seconds(600)]);
    let scheduler = scheduler(&cluster, config(), idle_timer());

    let report = block_on(scheduler.cleanup_now()).unwrap();
    assert_eq!(1, report.applied);
    assert_eq!(Some(1), cluster.ttl_of("scanjob-1"));

    // the steady state must not raise it again afterwards
    let report = scheduled_cycle(&scheduler).unwrap();
    assert_eq!(1, report.unchanged);
    assert_eq!(Some(1), cluster.ttl_of("scanjob-1"));
}

#[test]
fn list_failure_skips_the_cycle() {
    let cluster = FakeCluster::with_jobs(vec![ManagedObject::new("a", "scanjob-1")]);
    cluster.fail_list.store(true, Ordering::SeqCst);
    let scheduler = scheduler(&cluster, config(), idle_timer());

    let err = scheduled_cycle(&scheduler).unwrap_err();
    assert!(err.is_http_status(503));
    assert!(cluster.patches().is_empty());

    // recovers on the next cycle
    cluster.fail_list.store(false, Ordering::SeqCst);
    assert_eq!(1, scheduled_cycle(&scheduler).unwrap().applied);
}

#[test]
fn one_failed_patch_does_not_stop_the_others() {
    let cluster = FakeCluster::with_jobs(vec![
        ManagedObject::new("a", "scanjob-1"),
        ManagedObject::new("a", "scanjob-2"),
        ManagedObject::new("a", "scanjob-3"),
    ]);
    cluster
        .fail_patch_for
        .lock()
        .unwrap()
        .insert("scanjob-2".to_owned());
    let scheduler = scheduler(&cluster, config(), idle_timer());

    let report = scheduled_cycle(&scheduler).unwrap();
    assert_eq!(3, report.matched);
    assert_eq!(2, report.applied);
    assert_eq!(1, report.failed);
    assert_eq!(
        vec![
            (ObjectId::new("a", "scanjob-1"), 600),
            (ObjectId::new("a", "scanjob-3"), 600),
        ],
        cluster.patches()
    );
}

/// Deletes a job between the list and the patch
struct VanishingCluster(Arc<FakeCluster>);

#[async_trait]
impl TtlPatch for VanishingCluster {
    async fn patch_ttl(
        &self,
        kind: &K8sType,
        id: &ObjectIdRef<'_>,
        ttl_seconds: i64,
        resource_version: Option<&str>,
    ) -> Result<(), Error> {
        if id.name() == "scanjob-gone" {
            self.0.remove(id.name());
        }
        self.0
            .patch_ttl(kind, id, ttl_seconds, resource_version)
            .await
    }
}

#[test]
fn jobs_deleted_mid_cycle_count_as_done() {
    let cluster = FakeCluster::with_jobs(vec![
        ManagedObject::new("a", "scanjob-gone"),
        ManagedObject::new("a", "scanjob-1"),
    ]);
    let scheduler = Scheduler::new(
        &config(),
        cluster.clone(),
        VanishingCluster(cluster.clone()),
        idle_timer(),
        Arc::new(Metrics::new()),
    )
    .unwrap();

    let report = block_on(scheduler.run_cycle(600, PatchPolicy::Narrow, CycleMode::Scheduled))
        .unwrap();
    assert_eq!(1, report.applied);
    assert_eq!(1, report.not_found);
    assert_eq!(0, report.failed);
}

/// Runs a forced cleanup of every job just before forwarding the scheduled patch, as a
/// concurrent `cleanup-now` would between the scheduled cycle's list and its patch
struct RacingCleanup(Arc<FakeCluster>);

#[async_trait]
impl TtlPatch for RacingCleanup {
    async fn patch_ttl(
        &self,
        kind: &K8sType,
        id: &ObjectIdRef<'_>,
        ttl_seconds: i64,
        resource_version: Option<&str>,
    ) -> Result<(), Error> {
        self.0.patch_ttl(kind, id, 1, None).await?;
        self.0
            .patch_ttl(kind, id, ttl_seconds, resource_version)
            .await
    }
}

#[test]
fn steady_state_never_raises_a_ttl_lowered_after_the_list() {
    let cluster = FakeCluster::with_jobs(vec![
        ManagedObject::new("a", "scanjob-1").with_resource_version("7"),
        ManagedObject::new("a", "scanjob-2")
            .with_ttl_seconds(3600)
            .with_resource_version("9"),
    ]);
    let scheduler = Scheduler::new(
        &config(),
        cluster.clone(),
        RacingCleanup(cluster.clone()),
        idle_timer(),
        Arc::new(Metrics::new()),
    )
    .unwrap();

    let report = block_on(scheduler.run_cycle(600, PatchPolicy::Narrow, CycleMode::Scheduled))
        .unwrap();
    assert_eq!(0, report.applied);
    assert_eq!(2, report.unchanged);
    assert_eq!(0, report.failed);
    assert_eq!(Some(1), cluster.ttl_of("scanjob-1"));
    assert_eq!(Some(1), cluster.ttl_of("scanjob-2"));

    // the next cycle sees the lowered ttl and leaves it alone
    let scheduler = scheduler_for(&cluster);
    let report = scheduled_cycle(&scheduler).unwrap();
    assert_eq!(2, report.unchanged);
    assert_eq!(Some(1), cluster.ttl_of("scanjob-1"));
}

#[test]
fn only_finished_jobs_are_patched_when_configured() {
    use chrono::{TimeZone, Utc};

    let finished = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let cluster = FakeCluster::with_jobs(vec![
        ManagedObject::new("a", "scanjob-running"),
        ManagedObject::new("a", "scanjob-done").with_completion_time(finished),
    ]);
    let scheduler = scheduler(&cluster, config().only_finished(true), idle_timer());

    let report = scheduled_cycle(&scheduler).unwrap();
    assert_eq!(1, report.matched);
    assert_eq!(vec![(ObjectId::new("a", "scanjob-done"), 600)], cluster.patches());
}

#[test]
fn run_waits_the_interval_between_cycles_until_shut_down() {
    let cluster = FakeCluster::with_jobs(vec![ManagedObject::new("a", "scanjob-1")]);
    let shutdown = Arc::new(Shutdown::new());
    let interval = Duration::from_secs(42);
    let timer = FakeTimer::new(2, shutdown.clone());
    let sleeps = timer.sleeps.clone();
    let scheduler = scheduler(&cluster, config().with_interval(interval), timer);

    assert_eq!(SchedulerState::Idle, scheduler.state());
    block_on(scheduler.run(&shutdown));

    assert_eq!(SchedulerState::Idle, scheduler.state());
    assert_eq!(2, cluster.list_calls.load(Ordering::SeqCst));
    assert_eq!(vec![interval, interval], *sleeps.lock().unwrap());
    assert_eq!(1, cluster.patches().len());
}

#[test]
fn run_does_nothing_when_already_shut_down() {
    let cluster = FakeCluster::with_jobs(vec![ManagedObject::new("a", "scanjob-1")]);
    let shutdown = Arc::new(Shutdown::new());
    shutdown.trigger();
    let scheduler = scheduler(&cluster, config(), FakeTimer::new(1, shutdown.clone()));

    block_on(scheduler.run(&shutdown));
    assert_eq!(0, cluster.list_calls.load(Ordering::SeqCst));
    assert!(cluster.patches().is_empty());
}

#[test]
fn shutdown_during_a_cycle_lets_the_batch_finish() {
    let cluster = FakeCluster::with_jobs(vec![
        ManagedObject::new("a", "scanjob-1"),
        ManagedObject::new("a", "scanjob-2"),
    ]);
    let shutdown = Arc::new(Shutdown::new());
    *cluster.shutdown_on_list.lock().unwrap() = Some(shutdown.clone());
    let scheduler = scheduler(&cluster, config(), FakeTimer::new(usize::MAX, shutdown.clone()));

    block_on(scheduler.run(&shutdown));
    assert_eq!(1, cluster.list_calls.load(Ordering::SeqCst));
    assert_eq!(2, cluster.patches().len());
}

#[test]
fn invalid_config_is_rejected_at_startup() {
    let cluster = FakeCluster::with_jobs(Vec::new());
    let result = Scheduler::new(
        &ReaperConfig::new("job-reaper-test", ""),
        cluster.clone(),
        cluster.clone(),
        idle_timer(),
        Arc::new(Metrics::new()),
    );
    assert!(result.is_err());

    let result = Scheduler::new(
        &config().with_patch_concurrency(0),
        cluster.clone(),
        cluster,
        idle_timer(),
        Arc::new(Metrics::new()),
    );
    assert!(result.is_err());
}

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: String,
    path: String,
    query: Option<String>,
    content_type: Option<String>,
    authorization: Option<String>,
    body: Vec<u8>,
}

fn job(namespace: &str, name: &str, ttl: Option<i64>) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": { "namespace": namespace, "name": name, "resourceVersion": "41" },
        "spec": { "ttlSecondsAfterFinished": ttl },
    })
}

/// Two pages of jobs, and a 404 for patches to `scanjob-gone`
fn api_response(req: &RecordedRequest) -> (StatusCode, Value) {
    match (req.method.as_str(), req.path.as_str(), req.query.as_deref()) {
        ("GET", "/apis/batch/v1/jobs", Some("limit=2")) => (
            StatusCode::OK,
            json!({
                "kind": "JobList",
                "metadata": { "resourceVersion": "10", "continue": "page-2" },
                "items": [ job("a", "scanjob-1", None), job("a", "other-1", None) ],
            }),
        ),
        ("GET", "/apis/batch/v1/jobs", Some("limit=2&continue=page-2")) => (
            StatusCode::OK,
            json!({
                "kind": "JobList",
                "metadata": { "resourceVersion": "10", "continue": "" },
                "items": [ job("b", "scanjob-gone", Some(600)) ],
            }),
        ),
        ("PATCH", "/apis/batch/v1/namespaces/b/jobs/scanjob-gone", _) => (
            StatusCode::NOT_FOUND,
            json!({ "kind": "Status", "reason": "NotFound", "code": 404 }),
        ),
        ("PATCH", _, _) => (StatusCode::OK, json!({})),
        _ => (StatusCode::BAD_REQUEST, json!({})),
    }
}

fn header_value(req: &Request<Body>, name: http::header::HeaderName) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn start_api_server(requests: Arc<Mutex<Vec<RecordedRequest>>>) -> SocketAddr {
    let make_svc = make_service_fn(move |_| {
        let requests = requests.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let requests = requests.clone();
                async move {
                    let content_type = header_value(&req, http::header::CONTENT_TYPE);
                    let authorization = header_value(&req, http::header::AUTHORIZATION);
                    let method = req.method().to_string();
                    let path = req.uri().path().to_owned();
                    let query = req.uri().query().map(String::from);
                    let body = hyper::body::to_bytes(req.into_body()).await?;

                    let recorded = RecordedRequest {
                        method,
                        path,
                        query,
                        content_type,
                        authorization,
                        body: body.to_vec(),
                    };
                    let (status, response) = api_response(&recorded);
                    requests.lock().unwrap().push(recorded);
                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .status(status)
                            .header(http::header::CONTENT_TYPE, "application/json")
                            .body(Body::from(response.to_string()))
                            .unwrap(),
                    )
                }
            }))
        }
    });
    let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        api_server_endpoint: format!("http://{}", addr),
        credentials: Credentials::base64_bearer_token("test-token\n"),
        ca_data: None,
        user_agent: "job-reaper-test".to_owned(),
        impersonate: None,
        impersonate_groups: Vec::new(),
        verify_ssl_certs: true,
    }
}

#[test]
fn lister_follows_continue_tokens() {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let jobs = block_on(async {
        let addr = start_api_server(requests.clone()).await;
        let client = Client::new(client_config(addr), Metrics::new().client_metrics()).unwrap();
        let scope = ListScope {
            page_size: Some(2),
            ..Default::default()
        };
        ClusterLister::new(client, scope).list(JOB).await
    })
    .unwrap();

    let names: Vec<&str> = jobs.iter().filter_map(ManagedObject::name).collect();
    assert_eq!(vec!["scanjob-1", "other-1", "scanjob-gone"], names);
    assert_eq!(Some(600), jobs[2].ttl_seconds);
    assert_eq!(Some("41"), jobs[0].resource_version());

    let requests = requests.lock().unwrap();
    assert_eq!(2, requests.len());
    assert_eq!(Some("limit=2&continue=page-2"), requests[1].query.as_deref());
    assert_eq!(
        Some("Bearer test-token"),
        requests[0].authorization.as_deref()
    );
}

#[test]
fn cleanup_now_against_the_api_server() {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let report = block_on(async {
        let addr = start_api_server(requests.clone()).await;
        let client = Client::new(client_config(addr), Metrics::new().client_metrics()).unwrap();
        let scope = ListScope {
            page_size: Some(2),
            ..Default::default()
        };
        let lister = ClusterLister::new(client.clone(), scope);
        let scheduler = Scheduler::new(
            &config().with_page_size(2),
            lister,
            client,
            idle_timer(),
            Arc::new(Metrics::new()),
        )
        .unwrap();
        scheduler.cleanup_now().await
    })
    .unwrap();

    assert_eq!(
        CycleReport {
            listed: 3,
            matched: 2,
            applied: 1,
            not_found: 1,
            ..Default::default()
        },
        report
    );

    let requests = requests.lock().unwrap();
    let mut patches: Vec<&RecordedRequest> =
        requests.iter().filter(|r| r.method == "PATCH").collect();
    patches.sort_by(|a, b| a.path.cmp(&b.path));
    assert_eq!(2, patches.len());
    assert_eq!("/apis/batch/v1/namespaces/a/jobs/scanjob-1", patches[0].path);
    assert_eq!("/apis/batch/v1/namespaces/b/jobs/scanjob-gone", patches[1].path);
    for patch in patches {
        assert_eq!(
            Some("application/merge-patch+json"),
            patch.content_type.as_deref()
        );
        let body: Value = job_reaper::serde_json::from_slice(&patch.body).unwrap();
        assert_eq!(json!({"spec": {"ttlSecondsAfterFinished": 1}}), body);
    }
}

#[test]
fn scheduled_patches_carry_the_listed_resource_version() {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let report = block_on(async {
        let addr = start_api_server(requests.clone()).await;
        let client = Client::new(client_config(addr), Metrics::new().client_metrics()).unwrap();
        let scope = ListScope {
            page_size: Some(2),
            ..Default::default()
        };
        let lister = ClusterLister::new(client.clone(), scope);
        let scheduler = Scheduler::new(
            &config().with_page_size(2),
            lister,
            client,
            idle_timer(),
            Arc::new(Metrics::new()),
        )
        .unwrap();
        scheduler
            .run_cycle(600, PatchPolicy::Narrow, CycleMode::Scheduled)
            .await
    })
    .unwrap();

    // scanjob-gone already has ttl 600, so only scanjob-1 is patched
    assert_eq!(
        CycleReport {
            listed: 3,
            matched: 2,
            applied: 1,
            unchanged: 1,
            ..Default::default()
        },
        report
    );

    let requests = requests.lock().unwrap();
    let patches: Vec<&RecordedRequest> =
        requests.iter().filter(|r| r.method == "PATCH").collect();
    assert_eq!(1, patches.len());
    assert_eq!("/apis/batch/v1/namespaces/a/jobs/scanjob-1", patches[0].path);
    let body: Value = job_reaper::serde_json::from_slice(&patches[0].body).unwrap();
    assert_eq!(
        json!({
            "metadata": {"resourceVersion": "41"},
            "spec": {"ttlSecondsAfterFinished": 600}
        }),
        body
    );
}
