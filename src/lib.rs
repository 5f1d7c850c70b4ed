//! RUORI, a Kubernetes ingress controller.
//!
//! One process runs two planes: a control plane that watches `Ingress`
//! resources, decides class membership, and publishes the load-balancer
//! address into their status; and a data plane that terminates HTTP/HTTPS,
//! matches each request against the live rule set, and resolves the winning
//! backend at request time. TLS certificates are looked up per SNI name from
//! the `Ingress.spec.tls` secret references. An optional dev mode dispatches
//! requests through port-forwards to individual pods instead of cluster DNS.

pub mod apis;
pub mod config;
pub mod error;
pub mod index;
pub mod proxy;

pub use config::Settings;
pub use error::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
