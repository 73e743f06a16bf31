//! InsightService reconcile controller.
//!
//! The framework-facing entry point. One invocation handles one
//! `(namespace, name)` key: it runs the cross-declaration endpoint
//! propagation, loads the declarations in scope, and hands the named one to
//! the deployer. The hosting dispatcher serializes invocations per key and
//! retries failed passes with backoff; this controller keeps no retry loop
//! and no state of its own.

use std::sync::Arc;

use kube::ResourceExt;

use crate::capabilities::Capabilities;
use crate::crd::{EnvVarSpec, InsightService};
use crate::error::{OperatorError, OperatorResult};
use crate::resources;
use crate::store::{DependentKind, ObjectKey, ResourceStore};

use super::deployer::SingletonServiceDeployer;
use super::{HealthProbeStyle, ReconcileOutcome, ServiceDefinition};

/// Controller for InsightService declarations.
pub struct ServiceController<S: ResourceStore + ?Sized> {
    store: Arc<S>,
    definition: ServiceDefinition,
    capabilities: Capabilities,
}

impl<S: ResourceStore + ?Sized> Clone for ServiceController<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            definition: self.definition.clone(),
            capabilities: self.capabilities,
        }
    }
}

impl<S: ResourceStore + ?Sized> ServiceController<S> {
    /// Create a controller over `store` for the Insight workload type.
    pub fn new(store: Arc<S>, definition: ServiceDefinition, capabilities: Capabilities) -> Self {
        Self {
            store,
            definition,
            capabilities,
        }
    }

    /// Reconcile one declaration key.
    ///
    /// Safe to invoke concurrently for different keys and repeatedly for the
    /// same key; a pass that finds no declaration settles, since dependent
    /// cleanup rides on owner references.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> OperatorResult<ReconcileOutcome> {
        tracing::info!(
            namespace = %namespace,
            name = %name,
            "Reconciling InsightService"
        );

        let declarations = self.store.list_declarations(namespace).await?;
        let Some(service) = declarations.iter().find(|d| d.name_unchecked() == name) else {
            tracing::debug!(
                namespace = %namespace,
                name = %name,
                "Declaration no longer exists, settling"
            );
            return Ok(ReconcileOutcome::Settled);
        };

        // Cross-cutting side-effect first; a failure here fails the pass.
        self.propagate_endpoint(namespace, service, &declarations)
            .await?;

        let deployer =
            SingletonServiceDeployer::new(self.store.as_ref(), &self.definition, self.capabilities);
        match deployer.deploy(service).await {
            Err(err @ OperatorError::Store(_)) => {
                // Leave a breadcrumb for operators watching the object; the
                // pass still fails so the framework retries with backoff.
                let mut status = service.status.clone().unwrap_or_default();
                status.message = Some(format!("reconciliation stalled: {err}"));
                let _ = self
                    .store
                    .patch_declaration_status(namespace, name, &status)
                    .await;
                Err(err)
            }
            other => other,
        }
    }

    /// Push a publishing workload's cluster-internal URL into sibling
    /// declarations' env, so co-located workloads can reach it without
    /// knowing the naming convention.
    async fn propagate_endpoint(
        &self,
        namespace: &str,
        service: &InsightService,
        declarations: &[InsightService],
    ) -> OperatorResult<()> {
        let Some(var) = self.definition.endpoint_env_var.as_deref() else {
            return Ok(());
        };
        if !service.spec.publish_endpoint {
            return Ok(());
        }

        // Nothing worth publishing until the network service exists.
        let name = service.name_unchecked();
        let key = ObjectKey::new(DependentKind::Service, namespace, name.clone());
        if self.store.fetch(&key).await?.is_none() {
            return Ok(());
        }

        let endpoint = resources::internal_endpoint(&name, namespace, service.spec.http_port);
        for sibling in declarations {
            if sibling.name_unchecked() == name {
                continue;
            }
            let up_to_date = sibling.spec.env.iter().any(|e| {
                e.name == var
                    && e.secret_key_ref.is_none()
                    && e.value.as_deref() == Some(endpoint.as_str())
            });
            if up_to_date {
                continue;
            }

            let mut updated = sibling.clone();
            updated.spec.env.retain(|e| e.name != var);
            updated
                .spec
                .env
                .push(EnvVarSpec::value(var.to_string(), endpoint.clone()));

            tracing::info!(
                namespace = %namespace,
                sibling = %sibling.name_unchecked(),
                endpoint = %endpoint,
                "Propagating workload endpoint into sibling declaration"
            );
            self.store.update_declaration(&updated).await?;
        }

        Ok(())
    }
}

/// Definition of the Insight analytics workload type.
pub fn insight_service_definition() -> ServiceDefinition {
    ServiceDefinition {
        default_image: DEFAULT_IMAGE.to_string(),
        message_topics: MESSAGE_TOPICS.iter().map(|t| t.to_string()).collect(),
        requires_messaging: true,
        requires_persistence: true,
        health_probe: HealthProbeStyle::Quarkus,
        endpoint_env_var: Some(ENDPOINT_ENV_VAR.to_string()),
    }
}

/// Image deployed when a declaration does not name one.
const DEFAULT_IMAGE: &str = "quay.io/insight/insight-service:latest";

/// Env var under which a publishing workload's URL lands in siblings.
const ENDPOINT_ENV_VAR: &str = "INSIGHT_HTTP_URL";

// Topics the analytics workload always consumes.
const TOPIC_DECISION_EVENTS: &str = "insight-decision-events";
const TOPIC_MODEL_EVENTS: &str = "insight-model-events";
const TOPIC_EXPLAINABILITY_REQUESTS: &str = "insight-explainability-request";
const TOPIC_EXPLAINABILITY_RESULTS: &str = "insight-explainability-result";

const MESSAGE_TOPICS: [&str; 4] = [
    TOPIC_DECISION_EVENTS,
    TOPIC_MODEL_EVENTS,
    TOPIC_EXPLAINABILITY_REQUESTS,
    TOPIC_EXPLAINABILITY_RESULTS,
];
