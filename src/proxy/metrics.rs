//! Prometheus metrics and the probe endpoints.

use std::convert::Infallible;
use std::time::Duration;

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::Error;

lazy_static! {
    /// Process-wide metrics registry.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Proxied request counter.
    static ref HTTP_REQUESTS_TOTAL: IntCounterVec = {
        let opts = Opts::new("http_requests_total", "Total number of HTTP requests");
        let counter = IntCounterVec::new(opts, &["method", "status"])
            .expect("Failed to create HTTP request counter");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register HTTP request counter");
        counter
    };

    /// Proxied request latency histogram (seconds).
    static ref HTTP_REQUEST_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request latencies in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.010, 0.025, 0.050, 0.075, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
        ]);
        let histogram = HistogramVec::new(opts, &["method", "status"])
            .expect("Failed to create HTTP request duration histogram");
        REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register HTTP request duration histogram");
        histogram
    };

    /// Ingress reconciliation counter.
    static ref INGRESS_RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "ingress_reconciliations_total",
            "Total number of ingress reconciliations",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create ingress reconciliation counter");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register ingress reconciliation counter");
        counter
    };
}

fn status_label(status: u16) -> &'static str {
    match status {
        200 => "200",
        301 => "301",
        401 => "401",
        404 => "404",
        500 => "500",
        502 => "502",
        503 => "503",
        _ => "other",
    }
}

/// Record one proxied request.
pub fn record_request(method: &str, status: u16, duration: Duration) {
    let status = status_label(status);
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, status])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method, status])
        .observe(duration.as_secs_f64());
}

/// Record one ingress reconciliation outcome.
pub fn record_reconciliation(result: &str) {
    INGRESS_RECONCILIATIONS_TOTAL
        .with_label_values(&[result])
        .inc();
}

/// Render the registry in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>, prometheus::Error> {
    // Touch the lazy metrics so an unused process still exports them.
    let _ = &*HTTP_REQUESTS_TOTAL;
    let _ = &*HTTP_REQUEST_DURATION;
    let _ = &*INGRESS_RECONCILIATIONS_TOTAL;

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

fn text_response(status: StatusCode, body: Vec<u8>) -> Response<BoxBody<Bytes, hyper::Error>> {
    #[allow(clippy::unwrap_used)]
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .unwrap()
}

async fn metrics_endpoint(
    request: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    if request.uri().path() != "/metrics" || request.method() != Method::GET {
        return Ok(text_response(StatusCode::NOT_FOUND, b"not found\n".to_vec()));
    }
    match gather() {
        Ok(body) => Ok(text_response(StatusCode::OK, body)),
        Err(err) => Ok(text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}\n").into_bytes(),
        )),
    }
}

async fn probe_endpoint(
    request: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    match request.uri().path() {
        "/healthz" | "/readyz" => Ok(text_response(StatusCode::OK, b"ok\n".to_vec())),
        _ => Ok(text_response(StatusCode::NOT_FOUND, b"not found\n".to_vec())),
    }
}

async fn serve<F, Fut>(
    addr: String,
    what: &'static str,
    handler: F,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error>
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible>>
        + Send
        + 'static,
{
    let listener = TcpListener::bind(Settings::bind_addr(&addr)).await?;
    info!(%addr, "{what} server started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, _peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "{what} accept failed");
                continue;
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handler(req));
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }

    Ok(())
}

/// `/metrics` endpoint on the metrics bind address.
pub async fn serve_metrics(addr: String, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
    serve(addr, "metrics", metrics_endpoint, shutdown).await
}

/// `/healthz` and `/readyz` liveness pings on the probe bind address.
pub async fn serve_probes(addr: String, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
    serve(addr, "probe", probe_endpoint, shutdown).await
}
