//! Ingress status reconciliation.
//!
//! For every Ingress event the controller decides class membership and, for
//! members, publishes the load-balancer address into
//! `status.loadBalancer.ingress`. Ingresses carrying only the legacy class
//! annotation (or nothing, when our class is the cluster default) first get
//! the class name copied into `spec.ingressClassName`; the watch event that
//! update triggers performs the status write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{LoadBalancer, Settings};
use crate::error::Error;
use crate::index::{default_class_name, ClusterIndex, LEGACY_CLASS_ANNOTATION};
use crate::proxy::metrics;

/// Lease name used for leader election.
pub const LEADER_LEASE_NAME: &str = "ruori-ingress-controller-lock";

/// Field manager recorded on spec and status patches.
const FIELD_MANAGER: &str = "ruori-ingress-controller";

/// What one Ingress event asks of us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassAction {
    /// Ours; publish the load-balancer address.
    UpdateStatus,
    /// Copy this class name into `spec.ingressClassName` and stop; the next
    /// event handles the status.
    AdoptClassName(String),
    /// Not ours; leave it alone.
    Skip,
}

/// The class-association decision table.
pub fn classify(ingress: &Ingress, configured: &str, default_class: Option<&str>) -> ClassAction {
    let explicit = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref());

    if let Some(explicit) = explicit {
        return if explicit == configured {
            ClassAction::UpdateStatus
        } else {
            ClassAction::Skip
        };
    }

    if let Some(annotated) = ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(LEGACY_CLASS_ANNOTATION))
    {
        return if annotated == configured {
            ClassAction::AdoptClassName(configured.to_string())
        } else {
            ClassAction::Skip
        };
    }

    match default_class {
        Some(default) => ClassAction::AdoptClassName(default.to_string()),
        None => ClassAction::Skip,
    }
}

/// Context shared by every reconcile call.
pub struct StatusReconciler {
    client: Client,
    classes: Store<IngressClass>,
    services: Store<Service>,
    settings: Arc<Settings>,
    load_balancer: LoadBalancer,
    is_leader: Arc<AtomicBool>,
}

impl StatusReconciler {
    pub fn new(
        client: Client,
        index: &ClusterIndex,
        settings: Arc<Settings>,
        load_balancer: LoadBalancer,
        is_leader: Arc<AtomicBool>,
    ) -> Self {
        Self {
            client,
            classes: index.ingress_classes.clone(),
            services: index.services.clone(),
            settings,
            load_balancer,
            is_leader,
        }
    }

    async fn reconcile(ingress: Arc<Ingress>, ctx: Arc<Self>) -> Result<Action, Error> {
        if ctx.settings.leader_elect && !ctx.is_leader.load(Ordering::Relaxed) {
            debug!("not the leader, skipping reconciliation");
            return Ok(Action::requeue(Duration::from_secs(15)));
        }

        let name = ingress.name_any();
        let namespace = ingress.namespace().unwrap_or_default();
        let api: Api<Ingress> = Api::namespaced(ctx.client.clone(), &namespace);

        let default_class = default_class_name(&ctx.classes);
        match classify(
            &ingress,
            &ctx.settings.ingress_class_name,
            default_class.as_deref(),
        ) {
            ClassAction::Skip => {
                metrics::record_reconciliation("skipped");
                Ok(Action::await_change())
            }
            ClassAction::AdoptClassName(class) => {
                info!(ingress = %format!("{namespace}/{name}"), %class, "adopting class name into spec");
                let patch = json!({"spec": {"ingressClassName": class}});
                api.patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await?;
                metrics::record_reconciliation("adopted");
                // The spec update above produces the event that writes status.
                Ok(Action::await_change())
            }
            ClassAction::UpdateStatus => {
                let address = ctx.load_balancer.resolve(&ctx.services)?;
                let patch = json!({"status": {"loadBalancer": {"ingress": [address]}}});
                api.patch_status(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await?;
                debug!(ingress = %format!("{namespace}/{name}"), "status updated");
                metrics::record_reconciliation("success");
                Ok(Action::requeue(Duration::from_secs(300)))
            }
        }
    }

    fn error_policy(ingress: Arc<Ingress>, error: &Error, _ctx: Arc<Self>) -> Action {
        warn!(ingress = %ingress.name_any(), error = %error, "reconciliation failed");
        metrics::record_reconciliation("error");
        Action::requeue(Duration::from_secs(60))
    }

    /// Run the controller until the process shuts down.
    pub async fn run(self) {
        let api: Api<Ingress> = Api::all(self.client.clone());
        let ctx = Arc::new(self);

        info!("starting ingress status controller");

        Controller::new(api, WatcherConfig::default())
            .run(Self::reconcile, Self::error_policy, ctx)
            .for_each(|result| async move {
                match result {
                    Ok(object) => debug!(?object, "reconciled"),
                    Err(err) => debug!(error = %err, "reconciliation error"),
                }
            })
            .await;
    }
}

/// Keep acquiring/renewing the leadership lease until shutdown, then step
/// down so a waiting replica can take over immediately.
pub async fn leadership_loop(
    client: Client,
    is_leader: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let leadership = LeaseLock::new(
        client.clone(),
        client.default_namespace(),
        LeaseLockParams {
            holder_id: hostname(),
            lease_name: LEADER_LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    loop {
        match leadership.try_acquire_or_renew().await {
            Ok(lease) => {
                let was_leader = is_leader.swap(lease.acquired_lease, Ordering::Relaxed);
                if lease.acquired_lease && !was_leader {
                    info!("acquired leadership lease");
                } else if !lease.acquired_lease && was_leader {
                    warn!("lost leadership lease");
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to acquire or renew lease");
                is_leader.store(false, Ordering::Relaxed);
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }

    if is_leader.load(Ordering::Relaxed) {
        if let Err(err) = leadership.step_down().await {
            warn!(error = %err, "failed to release leadership lease");
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("ruori-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
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
    fn test_explicit_matching_class_updates_status() {
        let action = classify(&ingress(Some("go-ingress"), None), "go-ingress", None);
        assert_eq!(action, ClassAction::UpdateStatus);
    }

    #[test]
    fn test_explicit_other_class_is_skipped() {
        let action = classify(&ingress(Some("nginx"), None), "go-ingress", None);
        assert_eq!(action, ClassAction::Skip);
        // Annotation and default are irrelevant once the spec names a class.
        let action = classify(
            &ingress(Some("nginx"), Some("go-ingress")),
            "go-ingress",
            Some("go-ingress"),
        );
        assert_eq!(action, ClassAction::Skip);
    }

    #[test]
    fn test_matching_annotation_is_adopted() {
        let action = classify(&ingress(None, Some("go-ingress")), "go-ingress", None);
        assert_eq!(action, ClassAction::AdoptClassName("go-ingress".to_string()));
    }

    #[test]
    fn test_other_annotation_is_skipped() {
        let action = classify(
            &ingress(None, Some("nginx")),
            "go-ingress",
            Some("go-ingress"),
        );
        assert_eq!(action, ClassAction::Skip);
    }

    #[test]
    fn test_default_class_is_adopted() {
        let action = classify(&ingress(None, None), "go-ingress", Some("go-ingress"));
        assert_eq!(action, ClassAction::AdoptClassName("go-ingress".to_string()));
    }

    #[test]
    fn test_nothing_to_do_without_default() {
        let action = classify(&ingress(None, None), "go-ingress", None);
        assert_eq!(action, ClassAction::Skip);
    }
}
