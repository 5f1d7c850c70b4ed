//! Watch-backed view of the cluster.
//!
//! One reflector per resource kind keeps a local store in sync with the API
//! server. The dispatcher and the TLS resolver only ever read these stores;
//! nothing on the request path talks to the network. Each store has a single
//! writer (its reflector task) and any number of readers.

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::api::Api;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tracing::warn;

use crate::apis::v1alpha1::{BasicAuth, Proxy, Redirect};

/// Legacy class annotation on Ingress objects, predating
/// `spec.ingressClassName`.
pub const LEGACY_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Marks an IngressClass as the cluster default.
pub const DEFAULT_CLASS_ANNOTATION: &str = "ingressclass.kubernetes.io/is-default-class";

/// The store bundle both planes read from.
#[derive(Clone)]
pub struct ClusterIndex {
    pub ingresses: Store<Ingress>,
    pub ingress_classes: Store<IngressClass>,
    pub services: Store<Service>,
    pub pods: Store<Pod>,
    pub secrets: Store<Secret>,
    pub redirects: Store<Redirect>,
    pub proxies: Store<Proxy>,
    pub basic_auths: Store<BasicAuth>,
}

impl ClusterIndex {
    /// Start one reflector per resource kind and hand back their stores.
    pub fn spawn(client: &Client) -> Self {
        Self {
            ingresses: watch_all(client),
            ingress_classes: watch_all(client),
            services: watch_all(client),
            pods: watch_all(client),
            secrets: watch_all(client),
            redirects: watch_all(client),
            proxies: watch_all(client),
            basic_auths: watch_all(client),
        }
    }

    /// Block until every store has seen its initial list.
    pub async fn wait_ready(&self) {
        let _ = self.ingresses.wait_until_ready().await;
        let _ = self.ingress_classes.wait_until_ready().await;
        let _ = self.services.wait_until_ready().await;
        let _ = self.pods.wait_until_ready().await;
        let _ = self.secrets.wait_until_ready().await;
        let _ = self.redirects.wait_until_ready().await;
        let _ = self.proxies.wait_until_ready().await;
        let _ = self.basic_auths.wait_until_ready().await;
    }
}

fn watch_all<K>(client: &Client) -> Store<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = Api::all(client.clone());
    let (store, writer) = reflector::store();
    let stream = reflector::reflector(
        writer,
        watcher::watcher(api, watcher::Config::default()).default_backoff(),
    );

    tokio::spawn(async move {
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if let Err(err) = event {
                warn!(error = %err, kind = %K::kind(&()), "watch stream error");
            }
        }
    });

    store
}

/// Name of the IngressClass annotated as the cluster default, if any.
pub fn default_class_name(classes: &Store<IngressClass>) -> Option<String> {
    classes
        .state()
        .iter()
        .find(|class| {
            class
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(DEFAULT_CLASS_ANNOTATION))
                .map(|value| value == "true")
                .unwrap_or(false)
        })
        .and_then(|class| class.metadata.name.clone())
}

/// The class name an Ingress is effectively associated with: the explicit
/// `spec.ingressClassName`, else the legacy annotation, else the cluster
/// default class.
pub fn effective_class_name(ingress: &Ingress, classes: &Store<IngressClass>) -> Option<String> {
    if let Some(explicit) = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.clone())
    {
        return Some(explicit);
    }

    if let Some(annotated) = ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(LEGACY_CLASS_ANNOTATION))
    {
        return Some(annotated.clone());
    }

    default_class_name(classes)
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector::store::Writer;

    /// Seed a store by replaying watch events through its writer, the same
    /// way a live reflector would.
    pub fn seeded_store<K>(objects: Vec<K>) -> (Store<K>, Writer<K>)
    where
        K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug,
    {
        let (store, mut writer) = reflector::store();
        for object in objects {
            writer.apply_watcher_event(&watcher::Event::Apply(object));
        }
        (store, writer)
    }

    pub fn ingress_class(name: &str, is_default: bool) -> IngressClass {
        let annotations = is_default.then(|| {
            [(DEFAULT_CLASS_ANNOTATION.to_string(), "true".to_string())]
                .into_iter()
                .collect()
        });
        IngressClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use k8s_openapi::api::networking::v1::IngressSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ingress(class: Option<&str>, annotation: Option<&str>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("ing".to_string()),
                namespace: Some("default".to_string()),
                annotations: annotation.map(|value| {
                    [(LEGACY_CLASS_ANNOTATION.to_string(), value.to_string())]
                        .into_iter()
                        .collect()
                }),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: class.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_explicit_class_wins() {
        let (classes, _writer) = seeded_store(vec![ingress_class("other", true)]);
        let ing = ingress(Some("go-ingress"), Some("legacy"));
        assert_eq!(
            effective_class_name(&ing, &classes).as_deref(),
            Some("go-ingress")
        );
    }

    #[test]
    fn test_annotation_beats_default() {
        let (classes, _writer) = seeded_store(vec![ingress_class("other", true)]);
        let ing = ingress(None, Some("go-ingress"));
        assert_eq!(
            effective_class_name(&ing, &classes).as_deref(),
            Some("go-ingress")
        );
    }

    #[test]
    fn test_default_class_fallback() {
        let (classes, _writer) = seeded_store(vec![
            ingress_class("not-default", false),
            ingress_class("go-ingress", true),
        ]);
        let ing = ingress(None, None);
        assert_eq!(
            effective_class_name(&ing, &classes).as_deref(),
            Some("go-ingress")
        );
    }

    #[test]
    fn test_no_association() {
        let (classes, _writer) = seeded_store(vec![ingress_class("not-default", false)]);
        let ing = ingress(None, None);
        assert_eq!(effective_class_name(&ing, &classes), None);
    }
}
