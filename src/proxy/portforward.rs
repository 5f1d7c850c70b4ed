//! Pod port-forward dispatch.
//!
//! When the process runs outside the cluster, `*.svc.cluster.local` names
//! resolve nowhere, so instead each Service gets at most one live forward:
//! a loopback listener whose accepted connections are tunneled to a pod
//! through the API server's `portforward` subresource. The cache maps
//! `namespace/name` to the bound local address and is shared by every
//! request; entries are evicted when their supervisor exits so the next
//! request re-establishes.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{Pod, Service, ServicePort};
use k8s_openapi::api::networking::v1::IngressServiceBackend;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Client;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Error;

/// `namespace/name -> 127.0.0.1:port` plus the stop handles needed to tear
/// every forward down in reverse creation order.
///
/// Lookup-then-insert is not transactional: two concurrent misses for one
/// key may both establish a forward, and the loser's supervisor idles until
/// its own error path evicts it.
#[derive(Default)]
pub(crate) struct AddressTable {
    inner: Mutex<TableInner>,
    hits: AtomicU64,
}

#[derive(Default)]
struct TableInner {
    addrs: HashMap<String, SocketAddr>,
    stops: Vec<(String, watch::Sender<bool>)>,
}

impl AddressTable {
    fn lookup(&self, key: &str) -> Option<SocketAddr> {
        let addr = self.inner.lock().unwrap().addrs.get(key).copied();
        if addr.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        addr
    }

    fn insert(&self, key: &str, addr: SocketAddr, stop: watch::Sender<bool>) {
        let mut inner = self.inner.lock().unwrap();
        inner.addrs.insert(key.to_string(), addr);
        inner.stops.push((key.to_string(), stop));
    }

    fn evict(&self, key: &str) {
        self.inner.lock().unwrap().addrs.remove(key);
    }

    /// Forwards established so far, newest last.
    fn len(&self) -> usize {
        self.inner.lock().unwrap().addrs.len()
    }

    fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Stop every supervisor, newest first.
    fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, stop) in inner.stops.drain(..).rev() {
            let _ = stop.send(true);
        }
        inner.addrs.clear();
    }
}

/// At most one live forward per Service, reusable across requests.
pub struct ForwardCache {
    client: Client,
    services: Store<Service>,
    pods: Store<Pod>,
    table: Arc<AddressTable>,
}

impl ForwardCache {
    pub fn new(client: Client, services: Store<Service>, pods: Store<Pod>) -> Self {
        Self {
            client,
            services,
            pods,
            table: Arc::new(AddressTable::default()),
        }
    }

    /// Number of times a request reused an existing forward.
    pub fn cache_hits(&self) -> u64 {
        self.table.hits()
    }

    /// Number of live forwards.
    pub fn forward_count(&self) -> usize {
        self.table.len()
    }

    /// Close all forwards, newest first. Called once on process teardown.
    pub fn shutdown(&self) {
        self.table.shutdown();
    }

    /// The loopback address proxying to the given Service, establishing a
    /// forward on first use.
    pub async fn proxy_address(
        &self,
        namespace: &str,
        service: &IngressServiceBackend,
    ) -> Result<SocketAddr, Error> {
        let key = format!("{namespace}/{}", service.name);
        if let Some(addr) = self.table.lookup(&key) {
            debug!(%key, %addr, "reusing existing port-forward");
            return Ok(addr);
        }

        let svc = self
            .services
            .get(&ObjectRef::new(&service.name).within(namespace))
            .ok_or_else(|| Error::BackendObjectNotFound {
                kind: "Service",
                namespace: namespace.to_string(),
                name: service.name.clone(),
            })?;
        let spec = svc.spec.as_ref().ok_or(Error::NoRoutablePod)?;

        let svc_port = select_service_port(spec.ports.as_deref().unwrap_or(&[]), service)?;

        let selector = spec
            .selector
            .as_ref()
            .filter(|selector| !selector.is_empty())
            .ok_or(Error::NoRoutablePod)?;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        for pod in self.pods.state() {
            if pod.metadata.namespace.as_deref() != Some(namespace)
                || !labels_match(selector, pod.metadata.labels.as_ref())
            {
                continue;
            }
            let Some(pod_name) = pod.metadata.name.clone() else {
                continue;
            };
            let Some(target_port) = resolve_target_port(&svc_port, &pod) else {
                continue;
            };

            // One probe stream proves the pod accepts the upgrade before we
            // publish a local address for it.
            match api.portforward(&pod_name, &[target_port]).await {
                Ok(_probe) => {}
                Err(err) => {
                    warn!(%key, pod = %pod_name, error = %err, "port-forward attempt failed");
                    continue;
                }
            }

            let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
            let addr = listener.local_addr()?;
            let (stop_tx, stop_rx) = watch::channel(false);

            self.table.insert(&key, addr, stop_tx);
            debug!(%key, pod = %pod_name, %addr, "port-forward established");

            tokio::spawn(supervise(
                Arc::clone(&self.table),
                key.clone(),
                listener,
                api.clone(),
                pod_name,
                target_port,
                stop_rx,
            ));

            return Ok(addr);
        }

        Err(Error::NoRoutablePod)
    }
}

/// Accept loop for one forward. Each accepted connection gets its own
/// upgrade stream to the pinned pod. A failed upgrade means the pod is gone:
/// the entry is evicted and the loop ends, so the next request re-selects.
async fn supervise(
    table: Arc<AddressTable>,
    key: String,
    listener: TcpListener,
    api: Api<Pod>,
    pod_name: String,
    port: u16,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => accepted,
        };

        let conn = match accepted {
            Ok((conn, _peer)) => conn,
            Err(err) => {
                warn!(%key, error = %err, "port-forward listener failed");
                break;
            }
        };

        match api.portforward(&pod_name, &[port]).await {
            Ok(forwarder) => {
                tokio::spawn(tunnel(conn, forwarder, port, key.clone()));
            }
            Err(err) => {
                warn!(%key, pod = %pod_name, error = %err, "port-forward stream failed");
                break;
            }
        }
    }

    table.evict(&key);
    debug!(%key, "port-forward closed");
}

async fn tunnel(mut conn: TcpStream, mut forwarder: kube::api::Portforwarder, port: u16, key: String) {
    let Some(mut stream) = forwarder.take_stream(port) else {
        warn!(%key, "port-forward stream missing requested port");
        return;
    };

    if let Err(err) = tokio::io::copy_bidirectional(&mut conn, &mut stream).await {
        debug!(%key, error = %err, "port-forward connection ended");
    }

    drop(stream);
    let _ = forwarder.join().await;
}

/// Pick the ServicePort the backend reference names. A named reference must
/// exist and be TCP; a numbered reference falls back to the number itself
/// when the Service does not list it.
fn select_service_port(
    ports: &[ServicePort],
    backend: &IngressServiceBackend,
) -> Result<ServicePort, Error> {
    let port_ref = backend.port.as_ref().ok_or(Error::UnsupportedBackend)?;

    if let Some(name) = port_ref.name.as_deref().filter(|name| !name.is_empty()) {
        let port = ports
            .iter()
            .find(|port| port.name.as_deref() == Some(name))
            .ok_or_else(|| Error::UnknownServicePortName(name.to_string()))?;
        let protocol = port.protocol.as_deref().unwrap_or("TCP");
        if protocol != "TCP" {
            return Err(Error::UnsupportedServicePortProtocol(protocol.to_string()));
        }
        return Ok(port.clone());
    }

    let number = port_ref.number.ok_or(Error::UnsupportedBackend)?;
    Ok(ports
        .iter()
        .find(|port| port.port == number)
        .cloned()
        .unwrap_or(ServicePort {
            port: number,
            ..Default::default()
        }))
}

/// The pod-side port for a ServicePort: integer targets as-is, named
/// targets resolved against the pod's container ports, no target means the
/// service port itself.
fn resolve_target_port(svc_port: &ServicePort, pod: &Pod) -> Option<u16> {
    match &svc_port.target_port {
        Some(IntOrString::Int(number)) => u16::try_from(*number).ok(),
        Some(IntOrString::String(name)) => pod
            .spec
            .as_ref()?
            .containers
            .iter()
            .flat_map(|container| container.ports.as_deref().unwrap_or(&[]))
            .find(|port| port.name.as_deref() == Some(name))
            .and_then(|port| u16::try_from(port.container_port).ok()),
        None => u16::try_from(svc_port.port).ok(),
    }
}

fn labels_match(
    selector: &BTreeMap<String, String>,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(labels) = labels else {
        return false;
    };
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}
