//! Backend resolution.
//!
//! Called once per request, after the path matcher picked a rule. The
//! concrete backend object (Service port table, Redirect/Proxy/BasicAuth
//! resource, referenced Secret) is looked up from the watch cache at this
//! point, not at rule-build time, so edits take effect without a restart.
//! Nothing here talks to the API server directly.

use std::collections::HashMap;

use base64::Engine;
use futures::future::BoxFuture;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, AUTHORIZATION};
use hyper::Method;
use k8s_openapi::api::networking::v1::{HTTPIngressPath, IngressServiceBackend};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::debug;
use url::Url;

use crate::apis::v1alpha1::{self, BasicAuth, Proxy, Redirect};
use crate::error::Error;
use crate::index::ClusterIndex;
use crate::proxy::forward::{forward, HttpResponse, ProxyClient, UpstreamTarget};
use crate::proxy::portforward::ForwardCache;
use crate::proxy::server::responses;

/// A request after its body has been buffered, in the form the resolver
/// passes down (and rewrites) through strip-prefix and BasicAuth nesting.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxiedRequest {
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    fn with_path(mut self, path: String) -> Self {
        self.path = path;
        self
    }
}

/// Resolves one Ingress path entry into a served response.
#[derive(Clone)]
pub struct BackendResolver {
    index: ClusterIndex,
    client: ProxyClient,
    forwards: Option<std::sync::Arc<ForwardCache>>,
}

impl BackendResolver {
    pub fn new(
        index: ClusterIndex,
        client: ProxyClient,
        forwards: Option<std::sync::Arc<ForwardCache>>,
    ) -> Self {
        Self {
            index,
            client,
            forwards,
        }
    }

    /// Serve a request through the backend of one path entry.
    ///
    /// Boxed because a `BasicAuth` backend recurses into its nested entry.
    pub fn serve<'a>(
        &'a self,
        namespace: &'a str,
        entry: &'a HTTPIngressPath,
        request: ProxiedRequest,
    ) -> BoxFuture<'a, Result<HttpResponse, Error>> {
        Box::pin(async move {
            if let Some(service) = &entry.backend.service {
                return self.serve_service(namespace, service, &request).await;
            }
            self.serve_resource(namespace, entry, request).await
        })
    }

    async fn serve_service(
        &self,
        namespace: &str,
        service: &IngressServiceBackend,
        request: &ProxiedRequest,
    ) -> Result<HttpResponse, Error> {
        if let Some(forwards) = &self.forwards {
            let addr = forwards.proxy_address(namespace, service).await?;
            let target = UpstreamTarget {
                scheme: "http".to_string(),
                authority: addr.to_string(),
                path_and_query: request.path_and_query(),
            };
            return forward(
                &self.client,
                &target,
                request.method.clone(),
                &request.headers,
                request.body.clone(),
            )
            .await;
        }

        let port = match &service.port {
            Some(port) => match port.name.as_deref() {
                Some(name) if !name.is_empty() => {
                    self.named_service_port(namespace, &service.name, name)?
                }
                _ => port.number.ok_or(Error::UnsupportedBackend)?,
            },
            None => return Err(Error::UnsupportedBackend),
        };

        let target = UpstreamTarget {
            scheme: "http".to_string(),
            authority: format!("{}.{namespace}.svc.cluster.local:{port}", service.name),
            path_and_query: request.path_and_query(),
        };
        forward(
            &self.client,
            &target,
            request.method.clone(),
            &request.headers,
            request.body.clone(),
        )
        .await
    }

    /// Find a Service port by name and require it to be TCP. The proxy
    /// target is the service port number itself.
    fn named_service_port(&self, namespace: &str, service: &str, name: &str) -> Result<i32, Error> {
        let svc = self
            .index
            .services
            .get(&ObjectRef::new(service).within(namespace))
            .ok_or_else(|| Error::BackendObjectNotFound {
                kind: "Service",
                namespace: namespace.to_string(),
                name: service.to_string(),
            })?;

        let port = svc
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .and_then(|ports| {
                ports
                    .iter()
                    .find(|port| port.name.as_deref() == Some(name))
            })
            .ok_or_else(|| Error::UnknownServicePortName(name.to_string()))?;

        let protocol = port.protocol.as_deref().unwrap_or("TCP");
        if protocol != "TCP" {
            return Err(Error::UnsupportedServicePortProtocol(protocol.to_string()));
        }

        Ok(port.port)
    }

    async fn serve_resource(
        &self,
        namespace: &str,
        entry: &HTTPIngressPath,
        request: ProxiedRequest,
    ) -> Result<HttpResponse, Error> {
        let resource = entry.backend.resource.as_ref().ok_or(Error::UnsupportedBackend)?;

        // Admission enforces both of these; re-checked here so a stale or
        // hand-edited object cannot reach an arbitrary resolver branch.
        if entry.path_type != "ImplementationSpecific"
            || resource.api_group.as_deref() != Some(v1alpha1::GROUP)
        {
            return Err(Error::UnsupportedBackend);
        }

        let prefix = entry.path.as_deref().unwrap_or("");
        let Some(stripped) = strip_path_prefix(&request.path, prefix) else {
            return Ok(responses::not_found());
        };
        let request = request.with_path(stripped);

        match resource.kind.as_str() {
            "Redirect" => {
                let redirect: std::sync::Arc<Redirect> = self
                    .index
                    .redirects
                    .get(&ObjectRef::new(&resource.name).within(namespace))
                    .ok_or_else(|| Error::BackendObjectNotFound {
                        kind: "Redirect",
                        namespace: namespace.to_string(),
                        name: resource.name.clone(),
                    })?;

                let url = Url::parse(&redirect.spec.url)?;
                let location = join_url_path(&url, &request.path);
                debug!(location = %location, "redirecting");
                Ok(responses::moved_permanently(location.as_str()))
            }
            "Proxy" => {
                let proxy: std::sync::Arc<Proxy> = self
                    .index
                    .proxies
                    .get(&ObjectRef::new(&resource.name).within(namespace))
                    .ok_or_else(|| Error::BackendObjectNotFound {
                        kind: "Proxy",
                        namespace: namespace.to_string(),
                        name: resource.name.clone(),
                    })?;

                let url = Url::parse(&proxy.spec.url)?;
                let joined = join_url_path(&url, &request.path);
                let authority = match (joined.host_str(), joined.port()) {
                    (Some(host), Some(port)) => format!("{host}:{port}"),
                    (Some(host), None) => host.to_string(),
                    (None, _) => return Err(Error::UnsupportedBackend),
                };
                let path_and_query = match &request.query {
                    Some(query) => format!("{}?{}", joined.path(), query),
                    None => joined.path().to_string(),
                };
                let target = UpstreamTarget {
                    scheme: joined.scheme().to_string(),
                    authority,
                    path_and_query,
                };
                forward(
                    &self.client,
                    &target,
                    request.method.clone(),
                    &request.headers,
                    request.body.clone(),
                )
                .await
            }
            "BasicAuth" => self.serve_basic_auth(namespace, &resource.name, request).await,
            _ => Err(Error::UnsupportedBackend),
        }
    }

    async fn serve_basic_auth(
        &self,
        namespace: &str,
        name: &str,
        request: ProxiedRequest,
    ) -> Result<HttpResponse, Error> {
        let basic_auth: std::sync::Arc<BasicAuth> = self
            .index
            .basic_auths
            .get(&ObjectRef::new(name).within(namespace))
            .ok_or_else(|| Error::BackendObjectNotFound {
                kind: "BasicAuth",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        let secret_ref = &basic_auth.spec.secret_key_ref;
        let secret_name = secret_ref.name.as_str();
        if secret_name.is_empty() || secret_ref.key.is_empty() {
            return Err(Error::InvalidSecretKeyRef);
        }

        let secret = self
            .index
            .secrets
            .get(&ObjectRef::new(secret_name).within(namespace))
            .ok_or_else(|| Error::BackendObjectNotFound {
                kind: "Secret",
                namespace: namespace.to_string(),
                name: secret_name.to_string(),
            })?;

        let raw = secret
            .data
            .as_ref()
            .and_then(|data| data.get(&secret_ref.key))
            .ok_or(Error::SecretKeyNotFound)?;

        let credentials = parse_credentials(&raw.0);
        let realm = basic_auth.name_any();

        if !authorized(&credentials, request.headers.get(AUTHORIZATION)) {
            return Ok(responses::unauthorized(&realm));
        }

        // Admission rejects BasicAuth-in-BasicAuth; refuse the cycle here
        // as well before recursing.
        if basic_auth
            .spec
            .path
            .backend
            .resource
            .as_ref()
            .is_some_and(|nested| nested.kind == "BasicAuth")
        {
            return Err(Error::UnsupportedBackend);
        }

        self.serve(namespace, &basic_auth.spec.path, request).await
    }
}

/// Newline-delimited `user:bcrypt-hash` lines. Blank lines and lines
/// without a `:` are skipped.
fn parse_credentials(raw: &[u8]) -> HashMap<String, String> {
    String::from_utf8_lossy(raw)
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            line.split_once(':')
                .map(|(user, hash)| (user.to_string(), hash.to_string()))
        })
        .collect()
}

/// Check the `Authorization` header against the credential table. Every
/// failure mode produces the same `false`; the 401 never reveals which
/// component was wrong.
fn authorized(credentials: &HashMap<String, String>, header: Option<&hyper::header::HeaderValue>) -> bool {
    let Some(value) = header.and_then(|value| value.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, password)) = decoded.split_once(':') else {
        return false;
    };
    let Some(hash) = credentials.get(user) else {
        return false;
    };
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// `http.StripPrefix` semantics: an empty prefix passes the path through,
/// a non-matching prefix is a miss (404), a matching one is removed.
fn strip_path_prefix(path: &str, prefix: &str) -> Option<String> {
    if prefix.is_empty() {
        return Some(path.to_string());
    }
    path.strip_prefix(prefix).map(str::to_string)
}

/// Join a request path onto a base URL's path, cleaning duplicate slashes
/// and dot segments, keeping everything else about the URL intact.
pub fn join_url_path(base: &Url, suffix: &str) -> Url {
    let combined = format!("{}/{}", base.path(), suffix);
    let mut elements: Vec<&str> = Vec::new();
    for element in combined.split('/') {
        match element {
            "" | "." => {}
            ".." => {
                elements.pop();
            }
            other => elements.push(other),
        }
    }

    let mut path = String::new();
    for element in &elements {
        path.push('/');
        path.push_str(element);
    }
    if path.is_empty() {
        path.push('/');
    }

    let mut joined = base.clone();
    joined.set_path(&path);
    joined
}
