use crate::runner::metrics::Metrics;
use crate::runner::scheduler::Shutdown;

use hyper::server::Server;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response};

use std::net::SocketAddr;
use std::sync::Arc;

/// Serves `/metrics` and `/health` until `shutdown` is triggered. Failing to bind is logged but
/// does not stop the reaper itself.
pub(crate) async fn start(
    port: u16,
    metrics: Arc<Metrics>,
    serve_metrics: bool,
    serve_health: bool,
    shutdown: Arc<Shutdown>,
) {
    let address: SocketAddr = ([0u8; 4], port).into();
    log::info!(
        "Starting server on address: {}, exposing '/metrics': {}, '/health': {}",
        address,
        serve_metrics,
        serve_health
    );

    let svc = Svc::new(metrics, serve_metrics, serve_health);
    let service = make_service_fn(move |_| {
        let service = svc.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |request| {
                futures_util::future::ready(service.handle_request(request))
            }))
        }
    });

    let builder = match Server::try_bind(&address) {
        Ok(b) => b,
        Err(err) => {
            log::error!("Failed to bind server to {}: {}", address, err);
            return;
        }
    };
    let server = builder
        .serve(service)
        .with_graceful_shutdown(async move { shutdown.wait().await });
    if let Err(err) = server.await {
        log::error!("Server failed with error: {:?}", err);
    }
    log::debug!("Server stopped");
}

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
struct Svc {
    metrics: Arc<Metrics>,
    serve_metrics: bool,
    serve_health: bool,
}

impl Svc {
    fn new(metrics: Arc<Metrics>, serve_metrics: bool, serve_health: bool) -> Svc {
        Svc {
            metrics,
            serve_metrics,
            serve_health,
        }
    }

    fn not_found(&self) -> Result<Response<Body>, Error> {
        let resp = Response::builder().status(404).body(Body::empty())?;
        Ok(resp)
    }

    fn health(&self) -> Result<Response<Body>, Error> {
        let resp = Response::builder().status(200).body(Body::empty())?;
        Ok(resp)
    }

    fn metrics(&self) -> Result<Response<Body>, Error> {
        let body = self.metrics.encode_as_text()?;
        let resp = Response::builder()
            .status(200)
            .header(http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
            .body(Body::from(body))?;
        Ok(resp)
    }

    fn handle_request(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let req_path = request.uri().path().trim_end_matches('/');
        let req_method = request.method();

        log::debug!("Got http request {} {}", req_method, request.uri());

        let result = match (req_method, req_path) {
            (&Method::GET, "/health") if self.serve_health => self.health(),
            (&Method::GET, "/metrics") if self.serve_metrics => self.metrics(),
            _ => self.not_found(),
        };
        match result.as_ref() {
            Ok(resp) => log::debug!(
                "Finished handling {} {} with response status: {}",
                req_method,
                request.uri(),
                resp.status()
            ),
            Err(err) => log::error!(
                "Error handling {} {}, error: {:?}",
                req_method,
                request.uri(),
                err
            ),
        }
        result
    }
}
