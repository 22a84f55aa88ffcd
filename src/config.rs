mod kubeconfig;

use crate::filter::JobFilter;
use crate::k8s_types::{self, K8sType};

use std::fmt::{self, Display};
use std::path::Path;
use std::time::Duration;

pub use self::kubeconfig::{KubeConfig, KubeConfigError};

/// Steady-state value for `ttlSecondsAfterFinished`
pub const DEFAULT_TTL_SECONDS: i64 = 600;
/// Value used by the on-demand "cleanup now" cycle
pub const DEFAULT_FORCED_TTL_SECONDS: i64 = 1;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_PATCH_CONCURRENCY: usize = 4;
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// `ttlSecondsAfterFinished` is an int32 in the batch/v1 api
pub const MAX_TTL_SECONDS: i64 = i32::MAX as i64;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

/// Problems with a `ReaperConfig`. These are only ever returned at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidPrefix { prefix: String, reason: &'static str },
    InvalidTtl { name: &'static str, value: i64 },
    InvalidInterval,
    InvalidPatchConcurrency,
    InvalidPageSize,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConfigError::InvalidPrefix {
                ref prefix,
                reason,
            } => write!(f, "Invalid job name prefix '{}': {}", prefix, reason),
            ConfigError::InvalidTtl { name, value } => write!(
                f,
                "Invalid {}: {}, must be between 0 and {}",
                name, value, MAX_TTL_SECONDS
            ),
            ConfigError::InvalidInterval => f.write_str("Reconciliation interval must be non-zero"),
            ConfigError::InvalidPatchConcurrency => {
                f.write_str("Patch concurrency must be at least 1")
            }
            ConfigError::InvalidPageSize => f.write_str("List page size must be at least 1"),
        }
    }
}
impl std::error::Error for ConfigError {}

/// Everything the reaper needs to know about which jobs to look at and what to do with them.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaperConfig {
    /// Used as the user agent for api requests
    pub reaper_name: String,
    /// The type of resource to list and patch. Defaults to batch/v1 Jobs
    pub job_type: &'static K8sType,
    /// Jobs whose names start with this prefix are subject to ttl enforcement
    pub prefix: String,
    /// When set, only jobs that have a `status.completionTime` will match
    pub only_finished: bool,
    pub ttl_seconds: i64,
    pub forced_ttl_seconds: i64,
    pub interval: Duration,
    /// Restrict listing to a single namespace. `None` means all namespaces
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    /// Max number of concurrent patch requests within one cycle
    pub patch_concurrency: usize,
    /// When set, list requests are paged using `limit` and `continue`
    pub page_size: Option<u32>,
    pub server_port: u16,
    pub expose_metrics: bool,
    pub expose_health: bool,
}

impl ReaperConfig {
    pub fn new(reaper_name: impl Into<String>, prefix: impl Into<String>) -> ReaperConfig {
        ReaperConfig {
            reaper_name: reaper_name.into(),
            job_type: k8s_types::batch::v1::Job,
            prefix: prefix.into(),
            only_finished: false,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            forced_ttl_seconds: DEFAULT_FORCED_TTL_SECONDS,
            interval: DEFAULT_INTERVAL,
            namespace: None,
            label_selector: None,
            patch_concurrency: DEFAULT_PATCH_CONCURRENCY,
            page_size: None,
            server_port: DEFAULT_SERVER_PORT,
            expose_metrics: true,
            expose_health: true,
        }
    }

    pub fn with_job_type(mut self, job_type: &'static K8sType) -> Self {
        self.job_type = job_type;
        self
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_forced_ttl_seconds(mut self, forced_ttl_seconds: i64) -> Self {
        self.forced_ttl_seconds = forced_ttl_seconds;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn with_patch_concurrency(mut self, patch_concurrency: usize) -> Self {
        self.patch_concurrency = patch_concurrency;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn only_finished(mut self, only_finished: bool) -> Self {
        self.only_finished = only_finished;
        self
    }

    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn expose_metrics(mut self, expose_metrics: bool) -> Self {
        self.expose_metrics = expose_metrics;
        self
    }

    pub fn expose_health(mut self, expose_health: bool) -> Self {
        self.expose_health = expose_health;
        self
    }

    /// Checks every value and builds the job filter. Any error here is fatal, since a config
    /// never changes once the reaper is running.
    pub fn validate(&self) -> Result<JobFilter, ConfigError> {
        validate_ttl("ttl_seconds", self.ttl_seconds)?;
        validate_ttl("forced_ttl_seconds", self.forced_ttl_seconds)?;
        if self.interval == Duration::from_secs(0) {
            return Err(ConfigError::InvalidInterval);
        }
        if self.patch_concurrency == 0 {
            return Err(ConfigError::InvalidPatchConcurrency);
        }
        if self.page_size == Some(0) {
            return Err(ConfigError::InvalidPageSize);
        }
        JobFilter::new(self.prefix.as_str()).map(|f| f.only_finished(self.only_finished))
    }
}

fn validate_ttl(name: &'static str, value: i64) -> Result<(), ConfigError> {
    if value < 0 || value > MAX_TTL_SECONDS {
        Err(ConfigError::InvalidTtl { name, value })
    } else {
        Ok(())
    }
}

/// Certificate authority data used to verify the api server
#[derive(Debug, Clone, PartialEq)]
pub enum CAData {
    /// Path to a PEM file
    File(String),
    /// base64 encoded PEM contents, as they appear in `certificate-authority-data`
    Contents(String),
}

/// How the client authenticates with the api server
#[derive(Clone, PartialEq)]
pub enum Credentials {
    /// The full value of the `Authorization` header
    Header(String),
    PemPath {
        certificate_path: String,
        private_key_path: String,
    },
    Pem {
        certificate_base64: String,
        private_key_base64: String,
    },
}

impl Credentials {
    pub fn base64_bearer_token(token: impl AsRef<str>) -> Credentials {
        Credentials::Header(format!("Bearer {}", token.as_ref().trim()))
    }

    pub fn basic(username: &str, password: &str) -> Credentials {
        let encoded = base64::encode(format!("{}:{}", username, password));
        Credentials::Header(format!("Basic {}", encoded))
    }

    pub(crate) fn header_value(&self) -> Option<&str> {
        match self {
            Credentials::Header(ref value) => Some(value.as_str()),
            _ => None,
        }
    }
}

// hand written so that secrets don't end up in the logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Credentials::Header(_) => f.write_str("Header(<redacted>)"),
            Credentials::PemPath {
                ref certificate_path,
                ..
            } => write!(f, "PemPath({})", certificate_path),
            Credentials::Pem { .. } => f.write_str("Pem(<redacted>)"),
        }
    }
}

/// Connection settings for the Kubernetes api server
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub credentials: Credentials,
    pub ca_data: Option<CAData>,
    pub user_agent: String,
    pub impersonate: Option<String>,
    pub impersonate_groups: Vec<String>,
    pub verify_ssl_certs: bool,
}

impl ClientConfig {
    /// Loads the configuration from the service account that's mounted into every pod
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, std::io::Error> {
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)?;

        let ca_data = if Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            Some(CAData::File(SERVICE_ACCOUNT_CA_PATH.to_owned()))
        } else {
            None
        };

        Ok(ClientConfig {
            api_server_endpoint: format!("https://{}", API_SERVER_HOSTNAME),
            credentials: Credentials::base64_bearer_token(token),
            ca_data,
            user_agent: user_agent.into(),
            impersonate: None,
            impersonate_groups: Vec::new(),
            verify_ssl_certs: true,
        })
    }

    /// Loads the configuration from `$KUBECONFIG` or else `~/.kube/config`
    pub fn from_kubeconfig(user_agent: impl Into<String>) -> Result<ClientConfig, KubeConfigError> {
        kubeconfig::load_from_kubeconfig(user_agent.into())
    }

    pub fn from_kubeconfig_file(
        user_agent: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<ClientConfig, KubeConfigError> {
        kubeconfig::load_kubeconfig(user_agent.into(), path)
    }

    /// Tries the in-cluster service account first, and then falls back to the kubeconfig file
    pub fn load(user_agent: &str) -> Result<ClientConfig, KubeConfigError> {
        ClientConfig::from_service_account(user_agent).or_else(|err| {
            log::debug!(
                "Failed to load ClientConfig from service account: {}, so trying to load from kubeconfig",
                err
            );
            ClientConfig::from_kubeconfig(user_agent)
        })
    }
}
