use super::{CAData, ClientConfig, Credentials};

use dirs::home_dir;

use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

const MISSING_CREDENTIAL_MESSAGE: &str = "No supported credentials found in kubeconfig file for the selected context. Only token, username/password, client certificate, and exec are supported";
const NO_HOME_DIR_MESSAGE: &str = "Unable to determine HOME directory to load ~/.kube/config";

/// Error representing a problem with loading a kubeconfig file, or creating a `ClientConfig`
/// from it.
#[derive(Debug)]
pub enum KubeConfigError {
    Io(io::Error),
    Format(serde_yaml::Error),
    MissingCredentials,
    NoHomeDir,
    InvalidKubeconfig(String),
    ExecErr(String),
}

impl From<serde_yaml::Error> for KubeConfigError {
    fn from(err: serde_yaml::Error) -> KubeConfigError {
        KubeConfigError::Format(err)
    }
}

impl From<io::Error> for KubeConfigError {
    fn from(err: io::Error) -> KubeConfigError {
        KubeConfigError::Io(err)
    }
}

impl Display for KubeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            KubeConfigError::Io(ref e) => write!(f, "IO error: {}", e),
            KubeConfigError::Format(ref e) => write!(f, "Kubeconfig format error: {}", e),
            KubeConfigError::MissingCredentials => f.write_str(MISSING_CREDENTIAL_MESSAGE),
            KubeConfigError::NoHomeDir => f.write_str(NO_HOME_DIR_MESSAGE),
            KubeConfigError::InvalidKubeconfig(ref msg) => {
                write!(f, "Invalid kubeconfig file: {}", msg)
            }
            KubeConfigError::ExecErr(ref msg) => write!(f, "exec error: {}", msg),
        }
    }
}
impl std::error::Error for KubeConfigError {}

fn default_kubeconfig_path() -> Result<PathBuf, KubeConfigError> {
    std::env::var_os("KUBECONFIG")
        .map(PathBuf::from)
        .or_else(|| home_dir().map(|home| home.join(".kube").join("config")))
        .ok_or(KubeConfigError::NoHomeDir)
}

pub(crate) fn load_kubeconfig(
    user_agent: String,
    file_path: impl AsRef<Path>,
) -> Result<ClientConfig, KubeConfigError> {
    let path = file_path.as_ref();
    let kubeconfig = KubeConfig::load_file(path)?;
    let dir = path.parent().ok_or_else(|| {
        KubeConfigError::InvalidKubeconfig(format!(
            "cannot determine parent directory of '{}'",
            path.display()
        ))
    })?;
    kubeconfig.create_client_config(user_agent, dir)
}

pub(crate) fn load_from_kubeconfig(user_agent: String) -> Result<ClientConfig, KubeConfigError> {
    let path = default_kubeconfig_path()?;
    log::debug!("Loading kubeconfig from: {}", path.display());
    load_kubeconfig(user_agent, path)
}

fn get_credentials(user: &UserInfo, kube_config_dir: &Path) -> Result<Credentials, KubeConfigError> {
    if let Some(token) = user.token.as_ref() {
        log::debug!("Using auth token from kubeconfig");
        return Ok(Credentials::base64_bearer_token(token));
    }
    if let Some(username) = user.username.as_ref() {
        let pass = user.password.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig("username is specified but not password".to_owned())
        })?;
        log::debug!("Using username/password from kubeconfig");
        return Ok(Credentials::basic(username, pass));
    }
    if let Some(exec) = user.exec.as_ref() {
        return exec_token(exec).map(Credentials::Header);
    }

    if let Some(certificate_path) = user.client_certificate.as_ref() {
        let private_key_path = user.client_key.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(
                "'client-certificate' is specified, but 'client-key' is missing".to_owned(),
            )
        })?;
        return Ok(Credentials::PemPath {
            certificate_path: resolve(kube_config_dir, certificate_path),
            private_key_path: resolve(kube_config_dir, private_key_path),
        });
    }

    if let Some(certificate) = user.client_certificate_data.as_ref() {
        let private_key = user.client_key_data.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(
                "'client-certificate-data' is specified, but 'client-key-data' is missing"
                    .to_owned(),
            )
        })?;
        return Ok(Credentials::Pem {
            certificate_base64: certificate.clone(),
            private_key_base64: private_key.clone(),
        });
    }

    Err(KubeConfigError::MissingCredentials)
}

/// relative paths in a kubeconfig are relative to the file itself
fn resolve(kube_config_dir: &Path, path: impl AsRef<Path>) -> String {
    kube_config_dir.join(path).to_string_lossy().into_owned()
}

fn exec_token(exec: &Exec) -> Result<String, KubeConfigError> {
    use std::process::Command;

    log::debug!("Getting credentials from: {:?}", exec.command);
    let mut cmd = Command::new(exec.command.as_str());
    cmd.args(exec.args.iter());
    for var in exec.env.iter() {
        cmd.env(var.name.as_str(), var.value.as_str());
    }

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(KubeConfigError::ExecErr(format!(
            "command '{}' exited with status: {}",
            exec.command, output.status
        )));
    }
    let credential: ExecCredential =
        serde_yaml::from_slice(output.stdout.as_slice()).map_err(|err| {
            KubeConfigError::ExecErr(format!(
                "Invalid stdout from exec command: '{}' : err: {}",
                exec.command, err
            ))
        })?;

    log::info!(
        "Got token from command: '{}' with expiration: {:?}",
        exec.command,
        credential.status.expiration_timestamp
    );
    Ok(format!("Bearer {}", credential.status.token))
}

#[derive(Deserialize, Clone, Debug)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize, Clone, Debug)]
struct ExecCredentialStatus {
    token: String,
    #[serde(rename = "expirationTimestamp")]
    expiration_timestamp: Option<String>,
}

// Partial definitions of the kubeconfig structure, only what's needed to connect

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct ClusterInfo {
    server: String,
    certificate_authority_data: Option<String>,
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Cluster {
    name: String,
    cluster: ClusterInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct UserInfo {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
    client_certificate: Option<String>,
    client_key: Option<String>,
    #[serde(rename = "as")]
    as_user: Option<String>,
    #[serde(default)]
    as_groups: Vec<String>,
    exec: Option<Exec>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ExecEnv {
    name: String,
    value: String,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Exec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<ExecEnv>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct User {
    name: String,
    user: UserInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ContextInfo {
    cluster: String,
    user: String,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Context {
    name: String,
    context: ContextInfo,
}

/// A kubeconfig file that's been loaded into memory
#[derive(Deserialize, Debug, PartialEq, Clone)]
pub struct KubeConfig {
    #[serde(rename = "current-context")]
    current_context: String,
    clusters: Vec<Cluster>,
    users: Vec<User>,
    contexts: Vec<Context>,
}

impl KubeConfig {
    /// Loads from `$KUBECONFIG`, or `~/.kube/config` if that's unset. The path that was used is
    /// returned along with the config.
    pub fn load() -> Result<(KubeConfig, PathBuf), KubeConfigError> {
        let path = default_kubeconfig_path()?;
        let conf = KubeConfig::load_file(&path)?;
        Ok((conf, path))
    }

    pub fn load_file(path: &Path) -> Result<KubeConfig, KubeConfigError> {
        let reader = File::open(path)?;
        let conf = serde_yaml::from_reader(reader)?;
        Ok(conf)
    }

    /// Switches to a context other than the file's `current-context`
    pub fn use_context(mut self, context: impl Into<String>) -> Self {
        self.current_context = context.into();
        self
    }

    pub fn current_context(&self) -> &str {
        self.current_context.as_str()
    }

    /// Creates a `ClientConfig` for the current context. The `kubeconfig_parent_dir` is used to
    /// resolve relative file paths that appear in the file.
    pub fn create_client_config(
        &self,
        user_agent: String,
        kubeconfig_parent_dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        self.resolve(user_agent, kubeconfig_parent_dir)
    }

    fn resolve(
        &self,
        user_agent: String,
        kube_config_dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        let context = self
            .contexts
            .iter()
            .find(|ctx| ctx.name == self.current_context)
            .ok_or_else(|| {
                KubeConfigError::InvalidKubeconfig(format!(
                    "no context found for current context: '{}'",
                    self.current_context
                ))
            })?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                KubeConfigError::InvalidKubeconfig(format!(
                    "no cluster found for name: '{}'",
                    context.context.cluster
                ))
            })?;
        let user = self
            .users
            .iter()
            .find(|u| u.name == context.context.user)
            .map(|u| &u.user)
            .ok_or_else(|| {
                KubeConfigError::InvalidKubeconfig(format!(
                    "no user found for name: '{}'",
                    context.context.user
                ))
            })?;

        let credentials = get_credentials(user, kube_config_dir)?;

        let ca_data = cluster
            .certificate_authority_data
            .clone()
            .map(CAData::Contents)
            .or_else(|| {
                cluster.certificate_authority.as_ref().map(|ca_path| {
                    let resolved = resolve(kube_config_dir, ca_path);
                    log::debug!(
                        "Resolved cluster certificate-authority path '{}' to '{}'",
                        ca_path.display(),
                        resolved
                    );
                    CAData::File(resolved)
                })
            });

        Ok(ClientConfig {
            user_agent,
            credentials,
            impersonate: user.as_user.clone(),
            impersonate_groups: user.as_groups.clone(),
            api_server_endpoint: cluster.server.clone(),
            ca_data,
            verify_ssl_certs: !cluster.insecure_skip_tls_verify,
        })
    }
}
