mod request;

use crate::config::{CAData, ClientConfig, Credentials};
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::runner::metrics::ClientMetrics;

use bytes::Buf;
use http::{Request, Response, StatusCode};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use serde::de::DeserializeOwned;
use serde_json::Value;

use std::io;
use std::sync::Arc;
use std::time::Instant;

pub use self::request::{ListParams, Patch};

#[derive(Debug)]
pub enum Error {
    Io(hyper::Error),
    Serde(serde_json::Error),
    Http(StatusCode),
    Request(http::Error),
    InvalidUrl(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Serde(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Request(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Http(_) | Error::InvalidUrl(_) => None,
        }
    }
}

impl Error {
    pub fn http(status: StatusCode) -> Error {
        Error::Http(status)
    }

    pub fn is_http_status(&self, code: u16) -> bool {
        match self {
            Error::Http(ref status) => status.as_u16() == code,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.is_http_status(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.is_http_status(409)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "Io Error: {}", e),
            Error::Serde(ref e) => write!(f, "(De)Serialization error: {}", e),
            Error::Http(ref e) => write!(f, "Http Error: {}", e),
            Error::Request(ref e) => write!(f, "Invalid request: {}", e),
            Error::InvalidUrl(ref e) => write!(f, "Invalid api server url: {}", e),
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Io(e)
    }
}
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Serde(e)
    }
}
impl From<http::Error> for Error {
    fn from(e: http::Error) -> Error {
        Error::Request(e)
    }
}

#[derive(Debug)]
struct ClientInner {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: ClientConfig,
    metrics: ClientMetrics,
}

/// Client for the Kubernetes api server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

impl Client {
    pub fn new(mut config: ClientConfig, metrics: ClientMetrics) -> Result<Client, io::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let mut ssl = SslConnector::builder(SslMethod::tls())?;
        // enable http2 using alpn
        ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;
        if let Some(ca_data) = config.ca_data.take() {
            add_certificate_authority(&mut ssl, ca_data)?;
        }
        add_client_certificate(&mut ssl, &config.credentials)?;

        if config.verify_ssl_certs {
            ssl.set_verify(SslVerifyMode::PEER);
        } else {
            log::warn!("TLS Certificate verification has been disabled! All connections to the Kubernetes api server will be insecure!");
            ssl.set_verify(SslVerifyMode::NONE);
        }

        let https = HttpsConnector::with_connector(http, ssl)?;
        let client = HyperClient::builder().build(https);

        let inner = ClientInner {
            http_client: client,
            config,
            metrics,
        };
        Ok(Client(Arc::new(inner)))
    }

    /// Fetches a single page of resources. Pass the `continue` token from the previous page's
    /// metadata to get the next one.
    pub async fn list_page(
        &self,
        k8s_type: &K8sType,
        params: &ListParams<'_>,
    ) -> Result<ObjectList<Value>, Error> {
        let req = request::list_request(&self.0.config, k8s_type, params)?;
        let response = self.send(req).await?;
        read_json(response).await
    }

    pub async fn patch_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        patch: &Patch,
    ) -> Result<(), Error> {
        log::debug!("Patching {} '{}' with: {}", k8s_type, id, patch.value());
        let req = request::patch_request(&self.0.config, k8s_type, id, patch)?;
        let response = self.send(req).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        // jobs get deleted or modified out from under the reaper all the time, so neither a 404
        // nor a failed resourceVersion precondition is worth an error log
        if status != StatusCode::NOT_FOUND && status != StatusCode::CONFLICT {
            let body = hyper::body::to_bytes(response.into_body()).await?;
            log::error!(
                "Patch of {} '{}' was rejected with status: {}, body: {}",
                k8s_type,
                id,
                status,
                String::from_utf8_lossy(body.as_ref())
            );
        }
        Err(Error::http(status))
    }

    /// Sends the request and records how long it took to get the response headers
    async fn send(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        log::debug!("Sending {} {}", method, uri);

        let start_time = Instant::now();
        let timer = self.0.metrics.request_started();
        let result = self.0.http_client.request(req).await;
        timer.observe_duration();
        let millis = start_time.elapsed().as_millis();

        match result {
            Ok(response) => {
                log::debug!(
                    "{} {} returned status: {} in {}ms",
                    method,
                    uri,
                    response.status(),
                    millis
                );
                Ok(response)
            }
            Err(err) => {
                log::error!("{} {} failed after {}ms: {}", method, uri, millis, err);
                Err(err.into())
            }
        }
    }
}

async fn read_json<T: DeserializeOwned>(response: Response<Body>) -> Result<T, Error> {
    let status = response.status();
    if !status.is_success() {
        return Err(Error::http(status));
    }

    if log::log_enabled!(log::Level::Trace) {
        let body = hyper::body::to_bytes(response.into_body()).await?;
        log::trace!("Response body: {}", String::from_utf8_lossy(body.as_ref()));
        Ok(serde_json::from_slice(body.as_ref())?)
    } else {
        let body = hyper::body::aggregate(response.into_body()).await?;
        Ok(serde_json::from_reader(body.reader())?)
    }
}

fn invalid_base64(field: &str, err: base64::DecodeError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Invalid base64 content of {}: {}", field, err),
    )
}

fn add_certificate_authority(ssl: &mut SslConnectorBuilder, ca_data: CAData) -> Result<(), io::Error> {
    match ca_data {
        CAData::Contents(certs) => {
            // inline certs from a kubeconfig need to be parsed and added to the store by hand
            let decoded = base64::decode(&certs)
                .map_err(|err| invalid_base64("certificate-authority-data", err))?;
            let certs = X509::stack_from_pem(decoded.as_slice())?;
            let cert_store = ssl.cert_store_mut();
            for cert in certs {
                cert_store.add_cert(cert)?;
            }
        }
        CAData::File(path) => {
            ssl.set_ca_file(path.as_str())?;
        }
    }
    Ok(())
}

fn add_client_certificate(ssl: &mut SslConnectorBuilder, credentials: &Credentials) -> Result<(), io::Error> {
    let (cert_pem, key_pem) = match credentials {
        Credentials::PemPath {
            certificate_path,
            private_key_path,
        } => (std::fs::read(certificate_path)?, std::fs::read(private_key_path)?),
        Credentials::Pem {
            certificate_base64,
            private_key_base64,
        } => (
            base64::decode(certificate_base64)
                .map_err(|err| invalid_base64("client-certificate-data", err))?,
            base64::decode(private_key_base64)
                .map_err(|err| invalid_base64("client-key-data", err))?,
        ),
        Credentials::Header(_) => return Ok(()),
    };
    let cert = X509::from_pem(cert_pem.as_slice())?;
    let pkey = PKey::private_key_from_pem(key_pem.as_slice())?;
    ssl.set_certificate(&*cert)?;
    ssl.set_private_key(&*pkey)?;
    // ensures that the private key and certificate actually go together
    ssl.check_private_key()?;
    Ok(())
}

#[derive(Debug, Deserialize, PartialEq, Clone, Default)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
    #[serde(rename = "continue")]
    pub continue_token: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ObjectList<T> {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}
