//! Controller configuration.
//!
//! Everything the two planes need at runtime, resolved once at startup from
//! the command line. The one non-trivial piece is the `--load-balancer`
//! address: a URL-shaped string that is either a static host/IP (published
//! as-is into Ingress status) or a `service://namespace/name` reference that
//! is re-read from the Service's own load-balancer status on every
//! reconcile.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{IngressLoadBalancerIngress, IngressPortStatus};
use kube::runtime::reflector::{ObjectRef, Store};

use crate::error::Error;

/// Runtime settings shared by the dispatcher and the reconciler.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Plain HTTP listen address.
    pub http_addr: String,
    /// TLS listen address.
    pub https_addr: String,
    /// Metrics bind address.
    pub metrics_addr: String,
    /// Health/readiness bind address.
    pub probe_addr: String,
    /// Admission webhook bind address.
    pub webhook_addr: String,
    /// Directory holding the webhook serving key pair (`tls.crt`/`tls.key`).
    pub webhook_cert_dir: String,
    /// IngressClass name this controller claims.
    pub ingress_class_name: String,
    /// Dispatch to pods through port-forwards instead of cluster DNS.
    pub port_forward: bool,
    /// Gate the status reconciler behind a coordination Lease.
    pub leader_elect: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_addr: ":8080".to_string(),
            https_addr: ":8443".to_string(),
            metrics_addr: "127.0.0.1:8081".to_string(),
            probe_addr: "127.0.0.1:8082".to_string(),
            webhook_addr: ":9443".to_string(),
            webhook_cert_dir: "/tmp/k8s-webhook-server/serving-certs".to_string(),
            ingress_class_name: "go-ingress".to_string(),
            port_forward: false,
            leader_elect: false,
        }
    }
}

impl Settings {
    /// Normalize a `:port` style bind address into something a socket can
    /// bind (`:8080` means all interfaces).
    pub fn bind_addr(addr: &str) -> String {
        if let Some(port) = addr.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            addr.to_string()
        }
    }
}

/// Where the published load-balancer address comes from.
#[derive(Debug, Clone)]
pub enum LoadBalancer {
    /// Fixed host or IP, resolved once at startup.
    Static(IngressLoadBalancerIngress),
    /// Re-read from the named Service's `status.loadBalancer` per reconcile.
    Service {
        namespace: String,
        name: String,
        source: String,
    },
}

impl LoadBalancer {
    /// Parse the `--load-balancer` grammar.
    ///
    /// `raw://host[:port]` or a bare `host[:port]` is static; `service://`
    /// and `svc://` take a `namespace/name` reference.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::InvalidLoadBalancer(raw.to_string()));
        }

        if let Some(rest) = raw
            .strip_prefix("service://")
            .or_else(|| raw.strip_prefix("svc://"))
        {
            let (namespace, name) = rest
                .split_once('/')
                .ok_or_else(|| Error::InvalidLoadBalancer(raw.to_string()))?;
            if namespace.is_empty() || name.is_empty() || name.contains('/') {
                return Err(Error::InvalidLoadBalancer(raw.to_string()));
            }
            return Ok(Self::Service {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source: raw.to_string(),
            });
        }

        let rest = raw.strip_prefix("raw://").unwrap_or(raw);
        let (host, port) = split_host_port(rest);
        if host.is_empty() {
            return Err(Error::InvalidLoadBalancer(raw.to_string()));
        }

        let ports = port
            .map(|port| {
                vec![IngressPortStatus {
                    port: i32::from(port),
                    protocol: "tcp".to_string(),
                    error: None,
                }]
            })
            .unwrap_or_default();

        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let ingress = if bare.parse::<std::net::IpAddr>().is_ok() {
            IngressLoadBalancerIngress {
                ip: Some(bare.to_string()),
                hostname: None,
                ports: Some(ports),
            }
        } else {
            IngressLoadBalancerIngress {
                ip: None,
                hostname: Some(host.to_string()),
                ports: Some(ports),
            }
        };

        Ok(Self::Static(ingress))
    }

    /// Resolve the address to publish. Static sources never fail; a Service
    /// source fails the reconcile when the Service has no load-balancer
    /// ingress yet.
    pub fn resolve(&self, services: &Store<Service>) -> Result<IngressLoadBalancerIngress, Error> {
        match self {
            Self::Static(ingress) => Ok(ingress.clone()),
            Self::Service {
                namespace,
                name,
                source,
            } => {
                let svc = services
                    .get(&ObjectRef::new(name).within(namespace))
                    .ok_or_else(|| Error::NoLoadBalancerAddress(source.clone()))?;

                let lb = svc
                    .status
                    .as_ref()
                    .and_then(|status| status.load_balancer.as_ref())
                    .and_then(|lb| lb.ingress.as_ref())
                    .and_then(|ingress| ingress.first())
                    .ok_or_else(|| Error::NoLoadBalancerAddress(source.clone()))?;

                Ok(IngressLoadBalancerIngress {
                    ip: lb.ip.clone(),
                    hostname: lb.hostname.clone(),
                    ports: lb.ports.as_ref().map(|ports| {
                        ports
                            .iter()
                            .map(|p| IngressPortStatus {
                                port: p.port,
                                protocol: p.protocol.clone(),
                                error: p.error.clone(),
                            })
                            .collect()
                    }),
                })
            }
        }
    }
}

/// Split `host[:port]`, leaving bracketed IPv6 literals intact.
fn split_host_port(input: &str) -> (&str, Option<u16>) {
    if let Some(end) = input.rfind(']') {
        // [v6] or [v6]:port
        match input[end..].strip_prefix("]:") {
            Some(port) => (&input[..=end], port.parse().ok()),
            None => (input, None),
        }
    } else if let Some((host, port)) = input.rsplit_once(':') {
        match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (input, None),
        }
    } else {
        (input, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.http_addr, ":8080");
        assert_eq!(settings.https_addr, ":8443");
        assert_eq!(settings.metrics_addr, "127.0.0.1:8081");
        assert_eq!(settings.probe_addr, "127.0.0.1:8082");
        assert_eq!(settings.ingress_class_name, "go-ingress");
        assert!(!settings.port_forward);
        assert!(!settings.leader_elect);
    }

    #[test]
    fn test_bind_addr_expands_bare_port() {
        assert_eq!(Settings::bind_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(Settings::bind_addr("127.0.0.1:8081"), "127.0.0.1:8081");
    }

    #[test]
    fn test_parse_raw_hostname() {
        let lb = LoadBalancer::parse("raw://lb.example.com:443").unwrap();
        match lb {
            LoadBalancer::Static(ingress) => {
                assert_eq!(ingress.hostname.as_deref(), Some("lb.example.com"));
                assert_eq!(ingress.ip, None);
                let ports = ingress.ports.unwrap();
                assert_eq!(ports.len(), 1);
                assert_eq!(ports[0].port, 443);
                assert_eq!(ports[0].protocol, "tcp");
            }
            _ => panic!("expected static source"),
        }
    }

    #[test]
    fn test_parse_bare_ip_without_port() {
        let lb = LoadBalancer::parse("192.0.2.10").unwrap();
        match lb {
            LoadBalancer::Static(ingress) => {
                assert_eq!(ingress.ip.as_deref(), Some("192.0.2.10"));
                assert_eq!(ingress.hostname, None);
                assert_eq!(ingress.ports, Some(vec![]));
            }
            _ => panic!("expected static source"),
        }
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let lb = LoadBalancer::parse("raw://[2001:db8::1]:8443").unwrap();
        match lb {
            LoadBalancer::Static(ingress) => {
                assert_eq!(ingress.ip.as_deref(), Some("2001:db8::1"));
                assert_eq!(ingress.ports.unwrap()[0].port, 8443);
            }
            _ => panic!("expected static source"),
        }
    }

    #[test]
    fn test_parse_service_reference() {
        for raw in ["service://ingress/public-lb", "svc://ingress/public-lb"] {
            match LoadBalancer::parse(raw).unwrap() {
                LoadBalancer::Service {
                    namespace, name, ..
                } => {
                    assert_eq!(namespace, "ingress");
                    assert_eq!(name, "public-lb");
                }
                _ => panic!("expected service source"),
            }
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(LoadBalancer::parse("").is_err());
        assert!(LoadBalancer::parse("service://no-name").is_err());
        assert!(LoadBalancer::parse("svc://a/b/c").is_err());
    }

    #[test]
    fn test_resolve_service_without_address_fails() {
        let (store, _writer) = kube::runtime::reflector::store::<Service>();
        let lb = LoadBalancer::parse("service://ingress/public-lb").unwrap();
        let err = lb.resolve(&store).unwrap_err();
        assert!(err
            .to_string()
            .contains("unable to get load balancer ingress"));
    }
}
