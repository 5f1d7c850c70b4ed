//! Validating admission webhooks.
//!
//! Three rule sets, mirrored by the defensive checks in the resolver:
//! `Proxy`/`Redirect` URLs must be http(s); a `BasicAuth` needs a required
//! secret key and a nested backend that is not itself a `BasicAuth`; an
//! Ingress claimed by this controller may only carry Service backends or
//! resource backends from our API group. Validation is pure; the webhook
//! server is a thin AdmissionReview shim over it.

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use rustls::pki_types::PrivateKeyDer;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use url::Url;

use crate::apis::v1alpha1::{BasicAuthSpec, ProxySpec, RedirectSpec, BACKEND_KINDS, GROUP};
use crate::config::Settings;
use crate::error::Error;

pub const INGRESS_WEBHOOK_PATH: &str = "/validate-networking-v1-ingress";
pub const PROXY_WEBHOOK_PATH: &str = "/validate-backend-ingress-ruori-dev-v1alpha1-proxy";
pub const REDIRECT_WEBHOOK_PATH: &str = "/validate-backend-ingress-ruori-dev-v1alpha1-redirect";
pub const BASIC_AUTH_WEBHOOK_PATH: &str = "/validate-backend-ingress-ruori-dev-v1alpha1-basicauth";

fn validate_url(raw: &str, verb: &str) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|err| err.to_string())?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("cannot {verb} to scheme {other}")),
    }
}

pub fn validate_proxy(spec: &ProxySpec) -> Result<(), String> {
    validate_url(&spec.url, "proxy")
}

pub fn validate_redirect(spec: &RedirectSpec) -> Result<(), String> {
    validate_url(&spec.url, "redirect")
}

pub fn validate_basic_auth(spec: &BasicAuthSpec) -> Result<(), String> {
    if spec.secret_key_ref.optional == Some(true) {
        return Err("secret key is required".to_string());
    }

    validate_ingress_backend(Some(&spec.path.backend))?;

    if spec
        .path
        .backend
        .resource
        .as_ref()
        .is_some_and(|resource| resource.kind == "BasicAuth")
    {
        return Err("cannot use another basicauth as a basicauth backend".to_string());
    }

    Ok(())
}

pub fn validate_ingress_backend(backend: Option<&IngressBackend>) -> Result<(), String> {
    let Some(backend) = backend else {
        return Ok(());
    };
    if backend.service.is_some() {
        return Ok(());
    }
    let Some(resource) = &backend.resource else {
        return Err("backend must have a service or resource".to_string());
    };
    match resource.api_group.as_deref() {
        None => Err("backend resource must have an apiGroup".to_string()),
        Some(group) if group == GROUP => {
            if BACKEND_KINDS.contains(&resource.kind.as_str()) {
                Ok(())
            } else {
                Err(format!(
                    "unsupported backend resource kind {}",
                    resource.kind
                ))
            }
        }
        Some(_) => Err(format!(
            "{GROUP} is the only supported backend resource apiGroup"
        )),
    }
}

/// Validate an Ingress. Objects claimed by other controllers pass
/// untouched.
pub fn validate_ingress(ingress: &Ingress, class_name: &str) -> Result<(), String> {
    let Some(spec) = &ingress.spec else {
        return Ok(());
    };
    if spec.ingress_class_name.as_deref() != Some(class_name) {
        return Ok(());
    }

    validate_ingress_backend(spec.default_backend.as_ref())?;

    for rule in spec.rules.as_deref().unwrap_or(&[]) {
        let Some(http) = &rule.http else {
            continue;
        };
        for path in &http.paths {
            validate_ingress_backend(Some(&path.backend))?;
        }
    }

    Ok(())
}

fn typed_spec<T: serde::de::DeserializeOwned>(object: &DynamicObject) -> Result<T, String> {
    let spec = object
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| "object has no spec".to_string())?;
    serde_json::from_value(spec).map_err(|err| err.to_string())
}

/// Run one AdmissionReview through the validator selected by the webhook
/// path. Requests without an object (deletes) are allowed.
pub fn handle_review(
    path: &str,
    body: &[u8],
    class_name: &str,
) -> Result<AdmissionReview<DynamicObject>, String> {
    let review: AdmissionReview<DynamicObject> =
        serde_json::from_slice(body).map_err(|err| err.to_string())?;
    let request: AdmissionRequest<DynamicObject> =
        review.try_into().map_err(|err| format!("{err}"))?;

    let verdict = match &request.object {
        None => Ok(()),
        Some(object) => match path {
            INGRESS_WEBHOOK_PATH => serde_json::to_value(object)
                .and_then(serde_json::from_value::<Ingress>)
                .map_err(|err| err.to_string())
                .and_then(|ingress| validate_ingress(&ingress, class_name)),
            PROXY_WEBHOOK_PATH => typed_spec::<ProxySpec>(object).and_then(|spec| validate_proxy(&spec)),
            REDIRECT_WEBHOOK_PATH => {
                typed_spec::<RedirectSpec>(object).and_then(|spec| validate_redirect(&spec))
            }
            BASIC_AUTH_WEBHOOK_PATH => {
                typed_spec::<BasicAuthSpec>(object).and_then(|spec| validate_basic_auth(&spec))
            }
            other => Err(format!("unknown webhook path {other}")),
        },
    };

    let response = AdmissionResponse::from(&request);
    let response = match verdict {
        Ok(()) => response,
        Err(reason) => {
            debug!(%path, %reason, "denying admission");
            response.deny(reason)
        }
    };

    Ok(response.into_review())
}

fn webhook_response(status: StatusCode, body: Vec<u8>) -> Response<BoxBody<Bytes, hyper::Error>> {
    #[allow(clippy::unwrap_used)]
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .unwrap()
}

async fn webhook_endpoint(
    request: Request<Incoming>,
    class_name: Arc<String>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let path = request.uri().path().to_string();
    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return Ok(webhook_response(
                StatusCode::BAD_REQUEST,
                format!("{{\"error\":\"{err}\"}}").into_bytes(),
            ))
        }
    };

    match handle_review(&path, &body, &class_name) {
        Ok(review) => match serde_json::to_vec(&review) {
            Ok(body) => Ok(webhook_response(StatusCode::OK, body)),
            Err(err) => Ok(webhook_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{{\"error\":\"{err}\"}}").into_bytes(),
            )),
        },
        Err(err) => Ok(webhook_response(
            StatusCode::BAD_REQUEST,
            format!("{{\"error\":\"{err}\"}}").into_bytes(),
        )),
    }
}

fn load_server_config(cert_dir: &str) -> Result<Option<ServerConfig>, Error> {
    let crt_path = Path::new(cert_dir).join("tls.crt");
    let key_path = Path::new(cert_dir).join("tls.key");
    if !crt_path.exists() || !key_path.exists() {
        return Ok(None);
    }

    let crt = std::fs::read(&crt_path)?;
    let key = std::fs::read(&key_path)?;

    let invalid =
        |reason: String| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, reason));

    let certs = rustls_pemfile::certs(&mut &crt[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| invalid(format!("bad webhook certificate: {err}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key[..])
        .map_err(|err| invalid(format!("bad webhook key: {err}")))?
        .ok_or_else(|| invalid("no private key in webhook tls.key".to_string()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| invalid(format!("bad webhook key pair: {err}")))?;

    Ok(Some(config))
}

/// Serve the validating webhooks over TLS. When the cert directory holds no
/// key pair the server is skipped so the controller still runs in clusters
/// without webhook registration.
pub async fn serve(
    addr: String,
    cert_dir: String,
    class_name: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let Some(config) = load_server_config(&cert_dir)? else {
        warn!(%cert_dir, "no webhook serving certificate, webhooks disabled");
        let _ = shutdown.changed().await;
        return Ok(());
    };

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind(Settings::bind_addr(&addr)).await?;
    let class_name = Arc::new(class_name);
    info!(%addr, "webhook server started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, _peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "webhook accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let class_name = class_name.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    debug!(error = %err, "webhook tls handshake failed");
                    return;
                }
            };

            let service = service_fn(move |req| webhook_endpoint(req, class_name.clone()));
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .await;
        });
    }

    Ok(())
}
