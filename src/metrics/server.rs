//! HTTP server for Prometheus metrics endpoint

use super::Metrics;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// HTTP server that exposes Prometheus metrics
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Serve until `shutdown` flips to true
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics server listening on http://{}/metrics", self.addr);

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    debug!("Metrics server stopping");
                    return Ok(());
                }
            };
            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = metrics.clone();
                    async move { handle_request(req, metrics).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = metrics.registry.gather();
            let mut buffer = Vec::new();

            match encoder.encode(&metric_families, &mut buffer) {
                Ok(_) => {
                    let mut response = text_response(StatusCode::OK, buffer);
                    if let Ok(value) = encoder.format_type().parse() {
                        response
                            .headers_mut()
                            .insert(hyper::header::CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to encode metrics",
                    )
                }
            }
        }
        "/health" | "/healthz" => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
