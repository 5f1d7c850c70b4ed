//! Upstream forwarding.
//!
//! One pooled client serves every proxied request. Requests are rebuilt for
//! the upstream authority: hop-by-hop headers dropped, Host rewritten,
//! everything else passed through. Response bodies stream back unbuffered.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Method, Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::error;

use crate::error::Error;

/// Shared upstream client. HTTPS-capable because `Proxy` backends may point
/// at https URLs.
pub type ProxyClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// The response type every handler produces.
pub type HttpResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Build the pooled client used for every upstream request.
pub fn client() -> ProxyClient {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(60))
        .build(https)
}

/// Where a request is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub scheme: String,
    pub authority: String,
    pub path_and_query: String,
}

impl UpstreamTarget {
    pub fn uri(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority, self.path_and_query)
    }
}

/// Hop-by-hop headers are connection-scoped and must not be forwarded
/// (RFC 2616 section 13.5.1).
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Forward a buffered request to the target and stream the response back.
pub async fn forward(
    client: &ProxyClient,
    target: &UpstreamTarget,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<HttpResponse, Error> {
    let mut builder = Request::builder().method(method).uri(target.uri());

    for (name, value) in headers {
        if name != HOST && !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    if let Ok(host) = HeaderValue::from_str(&target.authority) {
        builder = builder.header(HOST, host);
    }

    let request = builder.body(Full::new(body))?;

    let response = client.request(request).await.map_err(|err| {
        error!(target = %target.uri(), error = %err, "upstream request failed");
        Error::Upstream(err)
    })?;

    Ok(response.map(BodyExt::boxed))
}
