use thiserror::Error;

/// Everything that can go wrong between accepting a request and a backend
/// answering, plus the control-plane failure modes.
///
/// Resolution errors surface verbatim as `500` bodies, so the `Display`
/// strings here are part of the observable behavior.
#[derive(Error, Debug)]
pub enum Error {
    /// Transient API transport failures; retried by the reconciler, returned
    /// as 500 to a live client.
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("unsupported ingress backend")]
    UnsupportedBackend,

    #[error("{kind} {namespace}/{name} not found")]
    BackendObjectNotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("unknown service port name {0}")]
    UnknownServicePortName(String),

    #[error("unsupported service port protocol {0}")]
    UnsupportedServicePortProtocol(String),

    #[error("unable to port-forward to any pods")]
    NoRoutablePod,

    #[error("invalid backend url: {0}")]
    InvalidBackendUrl(#[from] url::ParseError),

    #[error("invalid basic auth secret reference")]
    InvalidSecretKeyRef,

    #[error("basic auth secret key not found")]
    SecretKeyNotFound,

    #[error("invalid tls material in {namespace}/{name}: {reason}")]
    TlsMaterial {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("unable to get load balancer ingress from {0}")]
    NoLoadBalancerAddress(String),

    #[error("invalid load balancer address {0:?}")]
    InvalidLoadBalancer(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[source] hyper_util::client::legacy::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
