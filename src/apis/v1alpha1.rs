//! Custom backend resources, `backend.ingress.ruori.dev/v1alpha1`.
//!
//! An Ingress path may point at one of these instead of a Service (only
//! under `pathType: ImplementationSpecific`). They are looked up at request
//! time, so edits take effect without a restart.

use k8s_openapi::api::core::v1::SecretKeySelector;
use k8s_openapi::api::networking::v1::HTTPIngressPath;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the backend resources.
pub const GROUP: &str = "backend.ingress.ruori.dev";
/// API version of the backend resources.
pub const VERSION: &str = "v1alpha1";

/// Kinds the Ingress admission webhook accepts as resource backends.
pub const BACKEND_KINDS: [&str; 3] = ["BasicAuth", "Proxy", "Redirect"];

/// Issues a `301 Moved Permanently` to `spec.url` joined with the request
/// path. The URL scheme must be `http` or `https`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "backend.ingress.ruori.dev",
    version = "v1alpha1",
    kind = "Redirect",
    plural = "redirects",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RedirectSpec {
    pub url: String,
}

/// Reverse-proxies to `spec.url` joined with the request path. The URL
/// scheme must be `http` or `https`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "backend.ingress.ruori.dev",
    version = "v1alpha1",
    kind = "Proxy",
    plural = "proxies",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    pub url: String,
}

/// HTTP Basic gate in front of a nested backend.
///
/// The referenced secret key holds newline-delimited `user:bcrypt-hash`
/// lines. The embedded path entry is resolved only after the credentials
/// check passes; it must not point at another `BasicAuth`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize)]
#[kube(
    group = "backend.ingress.ruori.dev",
    version = "v1alpha1",
    kind = "BasicAuth",
    plural = "basicauths",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthSpec {
    pub secret_key_ref: SecretKeySelector,
    #[serde(flatten)]
    pub path: HTTPIngressPath,
}
