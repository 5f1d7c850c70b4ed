//! SNI certificate resolution.
//!
//! The TLS listener has no certificate of its own. During each handshake the
//! resolver walks the ingress cache for a rule host equal to the SNI name,
//! takes the first `spec.tls` entry listing that host, and decodes the
//! referenced secret's `tls.crt`/`tls.key` pair. No match means no
//! certificate (rustls aborts the handshake); a matched secret that fails to
//! load or decode is an error and never serves a stale certificate.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::{ObjectRef, Store};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::PrivateKeyDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, error};

use crate::error::Error;
use crate::index::ClusterIndex;

/// Resolves the serving certificate from `Ingress.spec.tls` secret
/// references, per handshake.
pub struct IngressCertResolver {
    ingresses: Store<Ingress>,
    secrets: Store<Secret>,
}

impl IngressCertResolver {
    pub fn new(index: &ClusterIndex) -> Self {
        Self {
            ingresses: index.ingresses.clone(),
            secrets: index.secrets.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_stores(ingresses: Store<Ingress>, secrets: Store<Secret>) -> Self {
        Self { ingresses, secrets }
    }

    /// The key pair for an SNI name. `Ok(None)` when no ingress rule matches
    /// the name or the matching ingress has no TLS entry for it; `Err` only
    /// when a matched secret cannot be loaded or decoded.
    pub fn certificate_for(&self, server_name: &str) -> Result<Option<Arc<CertifiedKey>>, Error> {
        for ingress in self.ingresses.state() {
            let Some(spec) = &ingress.spec else {
                continue;
            };

            let rule_matches = spec
                .rules
                .as_deref()
                .unwrap_or(&[])
                .iter()
                .any(|rule| rule.host.as_deref() == Some(server_name));
            if !rule_matches {
                continue;
            }

            let Some(tls) = spec.tls.as_deref().unwrap_or(&[]).iter().find(|tls| {
                tls.hosts
                    .as_deref()
                    .unwrap_or(&[])
                    .iter()
                    .any(|host| host == server_name)
            }) else {
                continue;
            };

            let Some(secret_name) = tls.secret_name.as_deref().filter(|name| !name.is_empty())
            else {
                continue;
            };

            let namespace = ingress.metadata.namespace.as_deref().unwrap_or_default();
            debug!(host = server_name, secret = %format!("{namespace}/{secret_name}"), "found matching tls entry");

            let secret = self
                .secrets
                .get(&ObjectRef::new(secret_name).within(namespace))
                .ok_or_else(|| Error::TlsMaterial {
                    namespace: namespace.to_string(),
                    name: secret_name.to_string(),
                    reason: "secret not found".to_string(),
                })?;

            return decode_key_pair(&secret, namespace, secret_name).map(Some);
        }

        Ok(None)
    }
}

fn decode_key_pair(
    secret: &Secret,
    namespace: &str,
    name: &str,
) -> Result<Arc<CertifiedKey>, Error> {
    let material = |reason: &str| Error::TlsMaterial {
        namespace: namespace.to_string(),
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let data = secret.data.as_ref().ok_or_else(|| material("secret has no data"))?;
    let crt = data.get("tls.crt").ok_or_else(|| material("missing tls.crt"))?;
    let key = data.get("tls.key").ok_or_else(|| material("missing tls.key"))?;

    let certs = rustls_pemfile::certs(&mut &crt.0[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| material(&format!("bad certificate pem: {err}")))?;
    if certs.is_empty() {
        return Err(material("no certificates in tls.crt"));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key.0[..])
        .map_err(|err| material(&format!("bad key pem: {err}")))?
        .ok_or_else(|| material("no private key in tls.key"))?;

    let signing_key =
        any_supported_type(&key).map_err(|err| material(&format!("unsupported key: {err}")))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

impl std::fmt::Debug for IngressCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IngressCertResolver")
    }
}

impl ResolvesServerCert for IngressCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        match self.certificate_for(server_name) {
            Ok(cert) => cert,
            Err(err) => {
                error!(host = server_name, error = %err, "certificate lookup failed");
                None
            }
        }
    }
}

/// Server config for the TLS listener: certificates from the resolver,
/// HTTP/1.1 only on the wire.
pub fn server_config(resolver: Arc<IngressCertResolver>) -> ServerConfig {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::test_util::seeded_store;
    use k8s_openapi::api::networking::v1::{IngressRule, IngressSpec, IngressTLS};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    const CRT: &[u8] = include_bytes!("../../test_fixtures/tls/example.com.crt");
    const KEY: &[u8] = include_bytes!("../../test_fixtures/tls/example.com.key");

    fn tls_secret(name: &str, crt: &[u8], key: &[u8]) -> Secret {
        let mut data = BTreeMap::new();
        data.insert("tls.crt".to_string(), ByteString(crt.to_vec()));
        data.insert("tls.key".to_string(), ByteString(key.to_vec()));
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    fn ingress(host: &str, tls_hosts: Option<&str>, secret: Option<&str>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("ing".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: None,
                }]),
                tls: tls_hosts.map(|tls_host| {
                    vec![IngressTLS {
                        hosts: Some(vec![tls_host.to_string()]),
                        secret_name: secret.map(str::to_string),
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn resolver(ingresses: Vec<Ingress>, secrets: Vec<Secret>) -> IngressCertResolver {
        let (ing_store, _ing_writer) = seeded_store(ingresses);
        let (sec_store, _sec_writer) = seeded_store(secrets);
        IngressCertResolver::from_stores(ing_store, sec_store)
    }

    #[test]
    fn test_matching_ingress_and_secret_yields_key_pair() {
        let resolver = resolver(
            vec![ingress("example.com", Some("example.com"), Some("example-tls"))],
            vec![tls_secret("example-tls", CRT, KEY)],
        );

        let cert = resolver.certificate_for("example.com").unwrap();
        assert!(cert.is_some());
        assert_eq!(cert.unwrap().cert.len(), 1);
    }

    #[test]
    fn test_no_matching_ingress_is_none_not_error() {
        let resolver = resolver(
            vec![ingress("example.com", Some("example.com"), Some("example-tls"))],
            vec![tls_secret("example-tls", CRT, KEY)],
        );
        assert!(resolver.certificate_for("unknown.test").unwrap().is_none());
    }

    #[test]
    fn test_matching_ingress_without_tls_is_none() {
        let resolver = resolver(vec![ingress("example.com", None, None)], vec![]);
        assert!(resolver.certificate_for("example.com").unwrap().is_none());
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let resolver = resolver(
            vec![ingress("example.com", Some("example.com"), Some("example-tls"))],
            vec![],
        );
        let err = resolver.certificate_for("example.com").unwrap_err();
        assert!(err.to_string().contains("secret not found"));
    }

    #[test]
    fn test_garbage_pem_is_an_error() {
        let resolver = resolver(
            vec![ingress("example.com", Some("example.com"), Some("example-tls"))],
            vec![tls_secret("example-tls", b"not a cert", b"not a key")],
        );
        assert!(resolver.certificate_for("example.com").is_err());
    }

    #[test]
    fn test_tls_entry_for_other_host_is_skipped() {
        // Rule host matches but the TLS entry lists a different host.
        let resolver = resolver(
            vec![ingress("example.com", Some("other.org"), Some("example-tls"))],
            vec![tls_secret("example-tls", CRT, KEY)],
        );
        assert!(resolver.certificate_for("example.com").unwrap().is_none());
    }
}
