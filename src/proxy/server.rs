//! Request dispatch and the two listeners.
//!
//! Both listeners feed the same dispatcher. Per request: snapshot the
//! ingress cache, keep ingresses whose effective class is ours, collect path
//! candidates for the request host (synthesizing a `Prefix /` candidate from
//! a default backend when nothing else matched), let the matcher pick one,
//! and hand the request to the backend resolver. No winner is a 404;
//! resolution failures are 500s with the error text.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST, LOCATION, WWW_AUTHENTICATE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use k8s_openapi::api::networking::v1::HTTPIngressPath;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::Error;
use crate::index::{effective_class_name, ClusterIndex};
use crate::proxy::backend::{BackendResolver, ProxiedRequest};
use crate::proxy::forward::HttpResponse;
use crate::proxy::metrics;
use crate::proxy::path::{self, Candidate};
use crate::proxy::tls::{server_config, IngressCertResolver};

/// Connections that do not produce a request line and headers within this
/// window are dropped.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Canned responses shared by the dispatcher and the backend resolver.
pub mod responses {
    use super::*;

    fn full(body: &str) -> BoxBody<Bytes, hyper::Error> {
        Full::new(Bytes::from(body.to_string()))
            .map_err(|never| match never {})
            .boxed()
    }

    /// The exact bytes `net/http`-style clients expect for a miss.
    pub fn not_found() -> HttpResponse {
        #[allow(clippy::unwrap_used)]
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("X-Content-Type-Options", "nosniff")
            .body(full("404 page not found\n"))
            .unwrap()
    }

    pub fn unauthorized(realm: &str) -> HttpResponse {
        let challenge = HeaderValue::from_str(&format!("Basic realm=\"{realm}\""))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
        #[allow(clippy::unwrap_used)]
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(WWW_AUTHENTICATE, challenge)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(full("401 not authorized\n"))
            .unwrap()
    }

    pub fn moved_permanently(location: &str) -> HttpResponse {
        match HeaderValue::from_str(location) {
            Ok(value) => {
                #[allow(clippy::unwrap_used)]
                Response::builder()
                    .status(StatusCode::MOVED_PERMANENTLY)
                    .header(LOCATION, value)
                    .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
                    .unwrap()
            }
            Err(_) => internal_error("invalid redirect location"),
        }
    }

    pub fn internal_error(message: &str) -> HttpResponse {
        #[allow(clippy::unwrap_used)]
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(full(&format!("{message}\n")))
            .unwrap()
    }
}

/// The backend a matched candidate resolves through.
#[derive(Debug, Clone)]
pub struct RuleBackend {
    pub namespace: String,
    pub entry: HTTPIngressPath,
}

/// The shared request entry point behind both listeners.
pub struct Dispatcher {
    index: ClusterIndex,
    resolver: BackendResolver,
    class_name: String,
}

impl Dispatcher {
    pub fn new(index: ClusterIndex, resolver: BackendResolver, class_name: String) -> Self {
        Self {
            index,
            resolver,
            class_name,
        }
    }

    /// Serve one request. Never errors; every failure mode has a response.
    pub async fn handle(&self, request: Request<Incoming>) -> Result<HttpResponse, Infallible> {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let host = request_host(&request);
        let (parts, body) = request.into_parts();
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();

        debug!(request_id = %request_id, host = host.as_deref().unwrap_or(""), method = %method, path = %path, "serving");

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!(request_id = %request_id, error = %err, "failed to read request body");
                return Ok(stamped(responses::internal_error(&err.to_string()), &request_id));
            }
        };

        let proxied = ProxiedRequest {
            method: parts.method,
            path,
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
            body,
        };

        let started = Instant::now();
        let response = self.route(host.as_deref(), proxied).await;
        metrics::record_request(method.as_str(), response.status().as_u16(), started.elapsed());

        Ok(stamped(response, &request_id))
    }

    async fn route(&self, host: Option<&str>, request: ProxiedRequest) -> HttpResponse {
        let Some(host) = host else {
            return responses::not_found();
        };

        let candidates = self.candidates(host);
        let Some(winner) = path::select(&request.path, &candidates) else {
            return responses::not_found();
        };

        let backend = &winner.backend;
        match self
            .resolver
            .serve(&backend.namespace, &backend.entry, request)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(namespace = %backend.namespace, error = %err, "backend resolution failed");
                responses::internal_error(&err.to_string())
            }
        }
    }

    /// Path candidates for one request host, in cache iteration order.
    fn candidates(&self, host: &str) -> Vec<Candidate<RuleBackend>> {
        let mut candidates = Vec::new();

        for ingress in self.index.ingresses.state() {
            if effective_class_name(&ingress, &self.index.ingress_classes).as_deref()
                != Some(self.class_name.as_str())
            {
                continue;
            }
            let Some(spec) = &ingress.spec else {
                continue;
            };
            let namespace = ingress.metadata.namespace.clone().unwrap_or_default();

            for rule in spec.rules.as_deref().unwrap_or(&[]) {
                if rule.host.as_deref() != Some(host) {
                    continue;
                }
                let Some(http) = &rule.http else {
                    continue;
                };

                for entry in &http.paths {
                    let pattern = entry.path.as_deref().unwrap_or("/");
                    let backend = RuleBackend {
                        namespace: namespace.clone(),
                        entry: entry.clone(),
                    };
                    match entry.path_type.as_str() {
                        "Exact" => candidates.push(Candidate::exact(pattern, backend)),
                        "Prefix" | "ImplementationSpecific" => {
                            candidates.push(Candidate::prefix(pattern, backend))
                        }
                        _ => {}
                    }
                }
            }

            if candidates.is_empty() {
                if let Some(default_backend) = &spec.default_backend {
                    let entry = HTTPIngressPath {
                        backend: default_backend.clone(),
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                    };
                    candidates.push(Candidate::prefix("/", RuleBackend { namespace, entry }));
                }
            }
        }

        candidates
    }
}

fn stamped(mut response: HttpResponse, request_id: &str) -> HttpResponse {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// The request host: URI authority for absolute-form requests, otherwise the
/// Host header, in both cases with any port suffix removed.
fn request_host(request: &Request<Incoming>) -> Option<String> {
    if let Some(host) = request.uri().host() {
        return Some(host.to_string());
    }
    let host = request.headers().get(HOST)?.to_str().ok()?.trim();
    Some(host_without_port(host).to_string())
}

fn host_without_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        // bracketed IPv6 literal
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Plain HTTP listener.
pub async fn serve_http(
    addr: String,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let listener = TcpListener::bind(Settings::bind_addr(&addr)).await?;
    info!(%addr, "http listener started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, _peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.handle(req).await }
            });
            if let Err(err) = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(HEADER_READ_TIMEOUT)
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(error = %err, "connection closed with error");
            }
        });
    }

    Ok(())
}

/// TLS listener. Certificates come from the SNI resolver per handshake; the
/// wire protocol is pinned to HTTP/1.1.
pub async fn serve_https(
    addr: String,
    dispatcher: Arc<Dispatcher>,
    resolver: Arc<IngressCertResolver>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let acceptor = TlsAcceptor::from(Arc::new(server_config(resolver)));
    let listener = TcpListener::bind(Settings::bind_addr(&addr)).await?;
    info!(%addr, "https listener started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    debug!(%peer, error = %err, "tls handshake failed");
                    return;
                }
            };

            let service = service_fn(move |req| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.handle(req).await }
            });
            if let Err(err) = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(HEADER_READ_TIMEOUT)
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                debug!(error = %err, "connection closed with error");
            }
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::test_util::{ingress_class, seeded_store};
    use crate::proxy::forward;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend,
        IngressSpec, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn init_crypto() {
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    fn empty_index() -> ClusterIndex {
        // Stores seeded by hand; the writers can drop, reads stay valid.
        let (ingresses, _w) = reflector::store();
        let (ingress_classes, _w) = reflector::store();
        let (services, _w) = reflector::store();
        let (pods, _w) = reflector::store();
        let (secrets, _w) = reflector::store();
        let (redirects, _w) = reflector::store();
        let (proxies, _w) = reflector::store();
        let (basic_auths, _w) = reflector::store();
        ClusterIndex {
            ingresses,
            ingress_classes,
            services,
            pods,
            secrets,
            redirects,
            proxies,
            basic_auths,
        }
    }

    fn service_backend(name: &str) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: name.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(80),
                    name: None,
                }),
            }),
            resource: None,
        }
    }

    fn path_entry(path: &str, path_type: &str, backend: &str) -> HTTPIngressPath {
        HTTPIngressPath {
            backend: service_backend(backend),
            path: Some(path.to_string()),
            path_type: path_type.to_string(),
        }
    }

    fn test_ingress(
        class: Option<&str>,
        host: &str,
        paths: Vec<HTTPIngressPath>,
        default_backend: Option<IngressBackend>,
    ) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("ing".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: class.map(str::to_string),
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HTTPIngressRuleValue { paths }),
                }]),
                default_backend,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn dispatcher_with(ingresses: Vec<Ingress>) -> Dispatcher {
        init_crypto();
        let mut index = empty_index();
        let (ing_store, writer) = seeded_store(ingresses);
        std::mem::forget(writer);
        index.ingresses = ing_store;
        let (class_store, writer) = seeded_store(vec![ingress_class("go-ingress", false)]);
        std::mem::forget(writer);
        index.ingress_classes = class_store;

        let resolver = BackendResolver::new(index.clone(), forward::client(), None);
        Dispatcher::new(index, resolver, "go-ingress".to_string())
    }

    #[test]
    fn test_candidates_respect_class_and_host() {
        let dispatcher = dispatcher_with(vec![
            test_ingress(
                Some("go-ingress"),
                "h",
                vec![
                    path_entry("/prefix", "Prefix", "a"),
                    path_entry("/exact", "Exact", "b"),
                ],
                None,
            ),
            test_ingress(
                Some("someone-else"),
                "h",
                vec![path_entry("/other", "Prefix", "c")],
                None,
            ),
        ]);

        let candidates = dispatcher.candidates("h");
        assert_eq!(candidates.len(), 2);
        assert!(dispatcher.candidates("other-host").is_empty());
    }

    #[test]
    fn test_default_backend_synthesized_when_nothing_matched() {
        let dispatcher = dispatcher_with(vec![test_ingress(
            Some("go-ingress"),
            "other-host",
            vec![path_entry("/x", "Prefix", "a")],
            Some(service_backend("fallback")),
        )]);

        let candidates = dispatcher.candidates("h");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].pattern(), "/");
        assert_eq!(
            candidates[0]
                .backend
                .entry
                .backend
                .service
                .as_ref()
                .unwrap()
                .name,
            "fallback"
        );
    }

    #[test]
    fn test_no_default_backend_when_a_path_matched() {
        let dispatcher = dispatcher_with(vec![test_ingress(
            Some("go-ingress"),
            "h",
            vec![path_entry("/x", "Prefix", "a")],
            Some(service_backend("fallback")),
        )]);

        let candidates = dispatcher.candidates("h");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].pattern(), "/x");
    }

    #[test]
    fn test_host_without_port() {
        assert_eq!(host_without_port("example.com:8443"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("[::1]:443"), "[::1]");
        assert_eq!(host_without_port("[::1]"), "[::1]");
    }

    async fn body_string(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// The routing truth table, end to end through selection and the canned
    /// responses.
    #[tokio::test]
    async fn test_request_table_end_to_end() {
        let candidates = vec![
            Candidate::prefix("/prefix", "prefixBody"),
            Candidate::exact("/exact", "exactBody"),
        ];

        async fn serve(request_path: &str, candidates: &[Candidate<&str>]) -> HttpResponse {
            match path::select(request_path, candidates) {
                Some(winner) => {
                    #[allow(clippy::unwrap_used)]
                    Response::builder()
                        .status(StatusCode::OK)
                        .body(
                            Full::new(Bytes::from(winner.backend))
                                .map_err(|never| match never {})
                                .boxed(),
                        )
                        .unwrap()
                }
                None => responses::not_found(),
            }
        }

        let table = [
            ("/notfound", 404, "404 page not found\n"),
            ("/prefi", 404, "404 page not found\n"),
            ("/exact/", 404, "404 page not found\n"),
            ("/exact", 200, "exactBody"),
            ("/Exact", 404, "404 page not found\n"),
            ("/prefix", 200, "prefixBody"),
            ("/prefix/", 200, "prefixBody"),
            ("/Prefix/", 404, "404 page not found\n"),
        ];

        for (request_path, status, body) in table {
            let response = serve(request_path, &candidates).await;
            assert_eq!(response.status().as_u16(), status, "status for {request_path}");
            assert_eq!(body_string(response).await, body, "body for {request_path}");
        }
    }

    #[tokio::test]
    async fn test_unauthorized_response_shape() {
        let response = responses::unauthorized("admin-auth");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"admin-auth\""
        );
        assert_eq!(body_string(response).await, "401 not authorized\n");
    }

    #[tokio::test]
    async fn test_internal_error_carries_message() {
        let response = responses::internal_error("unsupported ingress backend");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "unsupported ingress backend\n");
    }

    #[test]
    fn test_moved_permanently() {
        let response = responses::moved_permanently("https://target.example.com/x");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://target.example.com/x"
        );
    }
}
