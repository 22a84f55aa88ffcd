use job_reaper::config::{ClientConfig, KubeConfig, ReaperConfig, DEFAULT_SERVER_PORT};
use job_reaper::runner;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};

use std::path::PathBuf;
use std::time::Duration;

const REAPER_NAME: &str = "job-reaper";

/// Sets ttlSecondsAfterFinished on Kubernetes Jobs with a given name prefix, so the cluster
/// cleans them up
#[derive(Parser, Debug)]
#[command(name = "job-reaper", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enforce the ttl every interval until stopped with SIGINT or SIGTERM
    Run(RunArgs),
    /// Set the forced ttl on every matching job once, overriding the current ttl, and exit
    CleanupNow,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Jobs whose names start with this prefix are reaped
    #[arg(long, env = "JOB_REAPER_PREFIX", default_value = "scan-job-", global = true)]
    prefix: String,

    /// Only list jobs in this namespace, instead of all namespaces
    #[arg(long, env = "JOB_REAPER_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Label selector passed to the list request
    #[arg(long, env = "JOB_REAPER_LABEL_SELECTOR", global = true)]
    label_selector: Option<String>,

    /// Only reap jobs that have finished
    #[arg(long, env = "JOB_REAPER_ONLY_FINISHED", global = true)]
    only_finished: bool,

    /// Request jobs in pages of this size
    #[arg(long, env = "JOB_REAPER_PAGE_SIZE", global = true)]
    page_size: Option<u32>,

    /// Max number of patch requests in flight at once
    #[arg(long, env = "JOB_REAPER_CONCURRENCY", default_value_t = 4, global = true)]
    concurrency: usize,

    /// ttl applied by `cleanup-now`
    #[arg(long, env = "JOB_REAPER_FORCED_TTL_SECONDS", default_value_t = 1, global = true)]
    forced_ttl_seconds: i64,

    /// Path to a kubeconfig file. Without it the in-cluster service account is tried first,
    /// then $KUBECONFIG or ~/.kube/config
    #[arg(long, env = "JOB_REAPER_KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long, env = "JOB_REAPER_CONTEXT", global = true)]
    context: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// ttl enforced on every matching job
    #[arg(long, env = "JOB_REAPER_TTL_SECONDS", default_value_t = 600)]
    ttl_seconds: i64,

    /// Seconds between cycles
    #[arg(long, env = "JOB_REAPER_INTERVAL_SECONDS", default_value_t = 300)]
    interval_seconds: u64,

    /// Port for the /metrics and /health endpoints
    #[arg(long, env = "JOB_REAPER_SERVER_PORT", default_value_t = DEFAULT_SERVER_PORT)]
    server_port: u16,

    /// Don't serve /metrics
    #[arg(long, env = "JOB_REAPER_NO_METRICS")]
    no_metrics: bool,

    /// Don't serve /health
    #[arg(long, env = "JOB_REAPER_NO_HEALTH")]
    no_health: bool,
}

impl CommonArgs {
    fn reaper_config(&self) -> ReaperConfig {
        let mut config = ReaperConfig::new(REAPER_NAME, self.prefix.as_str())
            .only_finished(self.only_finished)
            .with_patch_concurrency(self.concurrency)
            .with_forced_ttl_seconds(self.forced_ttl_seconds);
        if let Some(namespace) = self.namespace.as_ref() {
            config = config.within_namespace(namespace.as_str());
        }
        if let Some(selector) = self.label_selector.as_ref() {
            config = config.with_label_selector(selector.as_str());
        }
        if let Some(page_size) = self.page_size {
            config = config.with_page_size(page_size);
        }
        config
    }

    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        if self.kubeconfig.is_none() && self.context.is_none() {
            return ClientConfig::load(REAPER_NAME).context("failed to load client configuration");
        }

        let (kubeconfig, path) = match self.kubeconfig.as_ref() {
            Some(path) => (KubeConfig::load_file(path)?, path.clone()),
            None => KubeConfig::load()?,
        };
        let kubeconfig = match self.context.as_ref() {
            Some(context) => kubeconfig.use_context(context.as_str()),
            None => kubeconfig,
        };
        let parent_dir = path
            .parent()
            .ok_or_else(|| anyhow!("kubeconfig path {} has no parent", path.display()))?;
        let config = kubeconfig
            .create_client_config(REAPER_NAME.to_owned(), parent_dir)
            .with_context(|| format!("failed to load kubeconfig from {}", path.display()))?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("job_reaper=info"))
        .init();

    let cli = Cli::parse();
    let client_config = cli.common.client_config()?;
    let config = cli.common.reaper_config();

    match cli.command {
        Command::Run(args) => {
            let config = config
                .with_ttl_seconds(args.ttl_seconds)
                .with_interval(Duration::from_secs(args.interval_seconds))
                .server_port(args.server_port)
                .expose_metrics(!args.no_metrics)
                .expose_health(!args.no_health);
            runner::run_reaper_with_client_config(config, client_config)
                .map_err(|err| anyhow!("{}", err))?;
        }
        Command::CleanupNow => {
            let report = runner::run_cleanup_now(config, client_config)
                .map_err(|err| anyhow!("{}", err))?;
            println!("{}", report);
            if report.failed > 0 {
                return Err(anyhow!("{} of {} patches failed", report.failed, report.matched));
            }
        }
    }
    Ok(())
}
