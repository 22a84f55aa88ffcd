pub mod client;
mod lister;
mod metrics;
mod patcher;
mod scheduler;
mod server;

pub use self::lister::{ClusterLister, ListScope, ResourceLister};
pub use self::metrics::Metrics;
pub use self::patcher::{target_ttl, PatchOutcome, PatchPolicy, TtlPatch, TtlPatcher};
pub use self::scheduler::{
    CycleMode, CycleReport, Scheduler, SchedulerState, Shutdown, Timer, TokioTimer,
};

use crate::config::{ClientConfig, ReaperConfig};
use crate::error::Error;
use client::Client;

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use std::sync::Arc;

type ClusterScheduler = Scheduler<ClusterLister, Client, TokioTimer>;

/// A handle to a running reaper, which allows for shutting it down. Dropping the handle also
/// tells the reaper to stop.
pub struct ReaperHandle {
    shutdown: Arc<Shutdown>,
    task: Option<JoinHandle<()>>,
}

impl std::ops::Drop for ReaperHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl ReaperHandle {
    /// Signals the reaper to stop. A batch of patches that is already in flight still finishes.
    pub fn shutdown_now(&self) {
        self.shutdown.trigger();
    }

    pub fn is_active(&self) -> bool {
        !self.shutdown.is_triggered()
            && self
                .task
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(false)
    }

    /// Waits for the reaper task to exit. This does not trigger the shutdown by itself.
    pub async fn stopped(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                log::error!("Reaper task failed: {}", err);
            }
        }
    }
}

/// Starts the reaper using the default client configuration and blocks the current thread until
/// the process receives SIGINT or SIGTERM. Returns an error only if startup fails.
pub fn run_reaper(config: ReaperConfig) -> Result<(), Error> {
    let client_config = ClientConfig::load(config.reaper_name.as_str())?;
    run_reaper_with_client_config(config, client_config)
}

/// Same as `run_reaper`, but with an explicit `ClientConfig`
pub fn run_reaper_with_client_config(
    config: ReaperConfig,
    client_config: ClientConfig,
) -> Result<(), Error> {
    let runtime = Runtime::new()?;
    let handle = start_reaper_with_runtime(&runtime, config, client_config)?;
    runtime.block_on(async move {
        wait_for_signal().await;
        log::info!("Received shutdown signal, letting the current cycle finish");
        handle.shutdown_now();
        handle.stopped().await;
    });
    Ok(())
}

/// Starts the reaper asynchronously using the provided runtime. This function will return
/// immediately with a handle that can be used to shut down the reaper at a later point. Will
/// return an error if the config is invalid or if it fails to create the http client.
pub fn start_reaper_with_runtime(
    runtime: &Runtime,
    config: ReaperConfig,
    client_config: ClientConfig,
) -> Result<ReaperHandle, Error> {
    let metrics = Arc::new(Metrics::new());
    let scheduler = create_scheduler(&config, client_config, metrics.clone())?;
    let shutdown = Arc::new(Shutdown::new());
    let task = runtime.spawn(run_with_scheduler(
        config,
        scheduler,
        metrics,
        shutdown.clone(),
    ));
    Ok(ReaperHandle {
        shutdown,
        task: Some(task),
    })
}

/// Runs a single forced cycle that sets the short ttl on every matching job, regardless of the
/// ttl it currently has, and then returns. Independent of any scheduled reaper that may be
/// running elsewhere.
pub fn run_cleanup_now(
    config: ReaperConfig,
    client_config: ClientConfig,
) -> Result<CycleReport, Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let metrics = Arc::new(Metrics::new());
    let scheduler = create_scheduler(&config, client_config, metrics)?;
    let report = runtime.block_on(scheduler.cleanup_now())?;
    Ok(report)
}

fn create_scheduler(
    config: &ReaperConfig,
    client_config: ClientConfig,
    metrics: Arc<Metrics>,
) -> Result<ClusterScheduler, Error> {
    // validate before doing anything that touches the network or the filesystem
    config.validate()?;
    let client = Client::new(client_config, metrics.client_metrics())?;
    let scope = ListScope {
        namespace: config.namespace.clone(),
        label_selector: config.label_selector.clone(),
        page_size: config.page_size,
    };
    let lister = ClusterLister::new(client.clone(), scope);
    let scheduler = Scheduler::new(config, lister, client, TokioTimer, metrics)?;
    Ok(scheduler)
}

async fn run_with_scheduler(
    config: ReaperConfig,
    scheduler: ClusterScheduler,
    metrics: Arc<Metrics>,
    shutdown: Arc<Shutdown>,
) {
    log::debug!("Starting reaper with configuration: {:?}", config);
    if config.expose_metrics || config.expose_health {
        let server_future = server::start(
            config.server_port,
            metrics,
            config.expose_metrics,
            config.expose_health,
            shutdown.clone(),
        );
        let reaper_future = scheduler.run(&shutdown);
        futures_util::future::join(server_future, reaper_future).await;
    } else {
        scheduler.run(&shutdown).await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            log::warn!("Unable to listen for SIGTERM: {}", err);
            wait_for_ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Unable to listen for ctrl-c, shutting down: {}", err);
    }
}
