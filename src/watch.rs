//! Watch registry.
//!
//! Assembles the controller's event subscriptions exactly once at startup:
//! the primary InsightService kind, pods and core dependents owned by a
//! declaration, and the optional-group kinds for which capability
//! negotiation succeeded. The watched set and the set of kinds the builder
//! can produce both derive from the same [`Capabilities`] value, so a kind
//! is watched if and only if the engine can create it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use crate::capabilities::Capabilities;
use crate::controller::{ReconcileOutcome, ServiceController};
use crate::crd::InsightService;
use crate::error::OperatorError;
use crate::ext::{ImageStream, Route};
use crate::store::{DependentKind, KubeStore};

/// The dependent kinds subscribed to under `capabilities`.
///
/// Single source of truth for the subscription plan; [`run`] registers
/// exactly these kinds plus the primary CRD and owned pods.
pub fn watched_kinds(capabilities: Capabilities) -> Vec<DependentKind> {
    let mut kinds = vec![
        DependentKind::Deployment,
        DependentKind::Service,
        DependentKind::ConfigMap,
    ];
    if capabilities.routes {
        kinds.push(DependentKind::Route);
    }
    if capabilities.image_streams {
        kinds.push(DependentKind::ImageStream);
    }
    kinds
}

/// Run the InsightService controller until shutdown.
///
/// The kube runtime owns dispatch: one invocation per key at a time,
/// different keys in parallel, owner translation for dependent events, and
/// backoff-retry of failed passes via the error policy.
pub async fn run(
    client: Client,
    controller: ServiceController<KubeStore>,
    capabilities: Capabilities,
) -> anyhow::Result<()> {
    tracing::info!(
        kinds = ?watched_kinds(capabilities),
        "Starting InsightService controller"
    );

    let services: Api<InsightService> = Api::all(client.clone());
    let watcher_config = WatcherConfig::default();

    let mut watches = Controller::new(services, watcher_config.clone())
        .owns(Api::<Pod>::all(client.clone()), watcher_config.clone())
        .owns(Api::<Deployment>::all(client.clone()), watcher_config.clone())
        .owns(Api::<Service>::all(client.clone()), watcher_config.clone())
        .owns(Api::<ConfigMap>::all(client.clone()), watcher_config.clone());
    if capabilities.routes {
        watches = watches.owns(Api::<Route>::all(client.clone()), watcher_config.clone());
    }
    if capabilities.image_streams {
        watches = watches.owns(Api::<ImageStream>::all(client.clone()), watcher_config.clone());
    }

    watches
        .shutdown_on_signal()
        .run(
            |service, ctx: Arc<ServiceController<KubeStore>>| async move {
                let namespace =
                    service
                        .namespace()
                        .ok_or_else(|| OperatorError::MissingNamespace {
                            name: service.name_any(),
                        })?;
                match ctx.reconcile(&namespace, &service.name_any()).await? {
                    ReconcileOutcome::Settled => Ok(Action::await_change()),
                    ReconcileOutcome::RequeueAfter(delay) => Ok(Action::requeue(delay)),
                }
            },
            |_service, error: &OperatorError, _ctx| {
                tracing::error!(error = %error, "Reconciliation error");
                Action::requeue(Duration::from_secs(30))
            },
            Arc::new(controller),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(service = %obj.name, ?action, "Reconciled InsightService");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Controller stream error");
                }
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_kinds_follow_capabilities() {
        let full = watched_kinds(Capabilities::all());
        assert!(full.contains(&DependentKind::Route));
        assert!(full.contains(&DependentKind::ImageStream));

        let bare = watched_kinds(Capabilities::none());
        assert!(!bare.contains(&DependentKind::Route));
        assert!(!bare.contains(&DependentKind::ImageStream));
        assert_eq!(
            bare,
            vec![
                DependentKind::Deployment,
                DependentKind::Service,
                DependentKind::ConfigMap,
            ]
        );
    }
}
