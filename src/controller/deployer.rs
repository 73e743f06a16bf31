//! Singleton service deployer.
//!
//! One reconciliation pass for one declaration: fetch the current dependent
//! objects, build the desired set, diff on the fields this operator owns,
//! apply idempotent corrections, then decide whether the pass settles or
//! re-triggers. All writes are optimistic; a lost race ends the pass with a
//! short requeue instead of a failure, and create-if-absent at the store is
//! what keeps concurrent passes from ever producing a second live instance.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Container, Probe, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::capabilities::Capabilities;
use crate::crd::{InsightService, InsightServiceStatus, ServicePhase};
use crate::error::{OperatorError, OperatorResult};
use crate::ext::{ImageStream, Route};
use crate::resources::{
    self, BuildInputs, DECLARED_REPLICAS_ANNOTATION, MESH_INJECT_ANNOTATION, PROPERTIES_FILE_KEY,
};
use crate::store::{DependentKind, DependentObject, ObjectKey, ResourceStore};

use super::requeue::{schedule, PendingCondition};
use super::{ReconcileOutcome, ServiceDefinition};

/// Runs one deploy pass per declaration.
pub struct SingletonServiceDeployer<'a, S: ResourceStore + ?Sized> {
    store: &'a S,
    definition: &'a ServiceDefinition,
    capabilities: Capabilities,
}

impl<'a, S: ResourceStore + ?Sized> SingletonServiceDeployer<'a, S> {
    /// Create a deployer over `store` for one workload type.
    pub fn new(store: &'a S, definition: &'a ServiceDefinition, capabilities: Capabilities) -> Self {
        Self {
            store,
            definition,
            capabilities,
        }
    }

    /// Run one full pass for `service`.
    pub async fn deploy(&self, service: &InsightService) -> OperatorResult<ReconcileOutcome> {
        let namespace = service
            .namespace()
            .ok_or_else(|| OperatorError::MissingNamespace {
                name: service.name_unchecked(),
            })?;
        let name = service.name_unchecked();
        let mut pending: Vec<PendingCondition> = Vec::new();

        // Fetching: infrastructure, external configuration, then the
        // dependents themselves further down.
        let inputs = self
            .gather_inputs(service, &namespace, &mut pending)
            .await?;
        let inputs = match inputs {
            Ok(inputs) => inputs,
            Err(validation) => return self.fail(service, &namespace, &name, validation).await,
        };

        // Building: one pure pass over the declaration.
        let desired = match resources::build_dependents(
            service,
            self.definition,
            self.capabilities,
            &inputs,
        ) {
            Ok(desired) => desired,
            Err(OperatorError::Validation(msg)) => {
                return self.fail(service, &namespace, &name, msg).await;
            }
            Err(e) => return Err(e),
        };

        // Diffing + Applying, one dependent at a time.
        let mut ready_replicas = 0;
        for desired_object in &desired {
            let key = desired_object.key();
            match self.store.fetch(&key).await? {
                None => {
                    tracing::info!(object = %key, "Creating dependent");
                    match self.store.create(desired_object).await {
                        Ok(()) => {
                            if key.kind == DependentKind::Deployment {
                                pending.push(PendingCondition::WorkloadNotReady);
                            }
                        }
                        Err(e) if e.is_conflict() => {
                            tracing::debug!(object = %key, "Concurrent create, backing off");
                            pending.push(PendingCondition::WriteConflict);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(observed) => {
                    if let Some(uid) = service.uid() {
                        if !observed.is_controlled_by(&uid) {
                            let msg = format!(
                                "{key} already exists and is not owned by this declaration"
                            );
                            return self.fail(service, &namespace, &name, msg).await;
                        }
                    }

                    if let DependentObject::Deployment(observed_deployment) = &observed {
                        ready_replicas = observed_deployment
                            .status
                            .as_ref()
                            .and_then(|s| s.ready_replicas)
                            .unwrap_or(0);
                        if ready_replicas < 1 {
                            pending.push(PendingCondition::WorkloadNotReady);
                        }
                    }

                    if let Some(updated) = merge_owned(&observed, desired_object) {
                        tracing::info!(object = %key, "Correcting drift on owned fields");
                        match self.store.update(&updated).await {
                            Ok(()) => {}
                            Err(e) if e.is_conflict() => {
                                tracing::debug!(object = %key, "Stale write, backing off");
                                pending.push(PendingCondition::WriteConflict);
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
        }

        self.prune_disabled_route(service, &namespace, &name, &desired)
            .await?;

        // Deciding.
        let outcome = match schedule(&pending) {
            Some(delay) => ReconcileOutcome::RequeueAfter(delay),
            None => ReconcileOutcome::Settled,
        };

        let status = InsightServiceStatus {
            phase: if pending.is_empty() {
                ServicePhase::Running
            } else {
                ServicePhase::Provisioning
            },
            ready_replicas,
            endpoint: pending
                .is_empty()
                .then(|| resources::internal_endpoint(&name, &namespace, service.spec.http_port)),
            message: pending.first().map(PendingCondition::describe),
            observed_generation: service.metadata.generation,
            last_updated: None,
        };
        self.patch_status_if_changed(service, &namespace, &name, status)
            .await?;

        Ok(outcome)
    }

    /// Fetch the inputs the builder must not fetch itself. The outer result
    /// carries store failures, the inner one validation failures.
    async fn gather_inputs(
        &self,
        service: &InsightService,
        namespace: &str,
        pending: &mut Vec<PendingCondition>,
    ) -> OperatorResult<Result<BuildInputs, String>> {
        let mut inputs = BuildInputs::default();

        let needs_infra = self.definition.requires_messaging || self.definition.requires_persistence;
        if needs_infra {
            let infra = self
                .store
                .get_infra(namespace, service.spec.infra_name())
                .await?;
            let status = infra.as_ref().and_then(|i| i.status.clone());
            inputs.messaging = status.as_ref().and_then(|s| s.messaging.clone());
            inputs.datastore = status.as_ref().and_then(|s| s.datastore.clone());

            if self.definition.requires_messaging {
                let topics = resources::required_topics(service, self.definition);
                let covered = inputs
                    .messaging
                    .as_ref()
                    .is_some_and(|m| m.covers(topics.iter().map(String::as_str)));
                if !covered {
                    pending.push(PendingCondition::InfraNotProvisioned(format!(
                        "messaging with topics [{}]",
                        topics.join(", ")
                    )));
                }
            }
            if self.definition.requires_persistence && inputs.datastore.is_none() {
                pending.push(PendingCondition::InfraNotProvisioned("datastore".into()));
            }
        }

        if let Some(bundle) = &service.spec.properties_config_map {
            match self.store.get_config_map(namespace, bundle).await? {
                Some(cm) => match cm.data.as_ref().and_then(|d| d.get(PROPERTIES_FILE_KEY)) {
                    Some(content) => inputs.external_properties = Some(content.clone()),
                    None => {
                        return Ok(Err(format!(
                            "referenced ConfigMap '{bundle}' has no '{PROPERTIES_FILE_KEY}' key"
                        )));
                    }
                },
                None => {
                    pending.push(PendingCondition::ConfigSourceMissing(bundle.clone()));
                }
            }
        }

        Ok(Ok(inputs))
    }

    /// Remove a previously created Route after its feature toggle was turned
    /// off. The one deletion this engine performs; everything else is left
    /// to owner-reference garbage collection.
    async fn prune_disabled_route(
        &self,
        service: &InsightService,
        namespace: &str,
        name: &str,
        desired: &[DependentObject],
    ) -> OperatorResult<()> {
        let route_desired = desired
            .iter()
            .any(|d| d.kind() == DependentKind::Route);
        if route_desired || !self.capabilities.routes {
            return Ok(());
        }

        let key = ObjectKey::new(DependentKind::Route, namespace, name);
        if let Some(observed) = self.store.fetch(&key).await? {
            let owned = service
                .uid()
                .map(|uid| observed.is_controlled_by(&uid))
                .unwrap_or(false);
            if owned {
                tracing::info!(object = %key, "Pruning route after exposure was disabled");
                self.store.delete(&key).await?;
            }
        }
        Ok(())
    }

    /// Record a validation failure in status and settle; an edit is the only
    /// way forward, so retrying would only spin.
    async fn fail(
        &self,
        service: &InsightService,
        namespace: &str,
        name: &str,
        message: String,
    ) -> OperatorResult<ReconcileOutcome> {
        tracing::warn!(service = %name, namespace = %namespace, %message, "Declaration rejected");
        let status = InsightServiceStatus {
            phase: ServicePhase::Failed,
            message: Some(message),
            observed_generation: service.metadata.generation,
            ..Default::default()
        };
        self.patch_status_if_changed(service, namespace, name, status)
            .await?;
        Ok(ReconcileOutcome::Settled)
    }

    /// Write status only when it materially changed, so a quiescent pass
    /// stays write-free.
    async fn patch_status_if_changed(
        &self,
        service: &InsightService,
        namespace: &str,
        name: &str,
        mut next: InsightServiceStatus,
    ) -> OperatorResult<()> {
        let current = service.status.clone().unwrap_or_default();
        let mut normalized = current.clone();
        normalized.last_updated = None;
        if normalized == next {
            return Ok(());
        }
        next.last_updated = Some(chrono::Utc::now().to_rfc3339());
        self.store
            .patch_declaration_status(namespace, name, &next)
            .await
            .map_err(OperatorError::from)
    }
}

/// Overlay the engine-owned fields of `desired` onto `observed`, returning
/// the object to write back, or `None` when nothing owned drifted. Fields
/// outside the ownership set (server-filled defaults, router-assigned
/// hosts, externally managed replica counts) are preserved.
fn merge_owned(observed: &DependentObject, desired: &DependentObject) -> Option<DependentObject> {
    match (observed, desired) {
        (DependentObject::Deployment(obs), DependentObject::Deployment(des)) => {
            merge_deployment(obs, des).map(DependentObject::Deployment)
        }
        (DependentObject::Service(obs), DependentObject::Service(des)) => {
            merge_service(obs, des).map(DependentObject::Service)
        }
        (DependentObject::ConfigMap(obs), DependentObject::ConfigMap(des)) => {
            merge_config_map(obs, des).map(DependentObject::ConfigMap)
        }
        (DependentObject::Route(obs), DependentObject::Route(des)) => {
            merge_route(obs, des).map(DependentObject::Route)
        }
        (DependentObject::ImageStream(obs), DependentObject::ImageStream(des)) => {
            merge_image_stream(obs, des).map(DependentObject::ImageStream)
        }
        // Kinds never disagree: both sides come from the same key.
        _ => None,
    }
}

fn merge_deployment(observed: &Deployment, desired: &Deployment) -> Option<Deployment> {
    let mut updated = observed.clone();
    let mut changed = overlay_labels(&mut updated.metadata, &desired.metadata);

    let declared = desired
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let recorded = observed
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DECLARED_REPLICAS_ANNOTATION))
        .and_then(|v| v.parse::<i32>().ok());
    if recorded != Some(declared) {
        // The declaration changed (or was never recorded): reassert it.
        // Otherwise drift belongs to an external scaler and stays.
        if let Some(spec) = updated.spec.as_mut() {
            spec.replicas = Some(declared);
        }
        updated
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(DECLARED_REPLICAS_ANNOTATION.to_string(), declared.to_string());
        changed = true;
    }

    if let (Some(obs_spec), Some(des_spec)) = (updated.spec.as_mut(), desired.spec.as_ref()) {
        let des_template = &des_spec.template;

        // Pod template labels and the mesh-injection annotation.
        let obs_template_meta = obs_spec
            .template
            .metadata
            .get_or_insert_with(Default::default);
        if let Some(des_meta) = des_template.metadata.as_ref() {
            if let Some(des_labels) = des_meta.labels.as_ref() {
                let labels = obs_template_meta.labels.get_or_insert_with(BTreeMap::new);
                for (k, v) in des_labels {
                    if labels.get(k) != Some(v) {
                        labels.insert(k.clone(), v.clone());
                        changed = true;
                    }
                }
            }
            let desired_mesh = des_meta
                .annotations
                .as_ref()
                .and_then(|a| a.get(MESH_INJECT_ANNOTATION))
                .cloned();
            let annotations = obs_template_meta
                .annotations
                .get_or_insert_with(BTreeMap::new);
            match desired_mesh {
                Some(value) => {
                    if annotations.get(MESH_INJECT_ANNOTATION) != Some(&value) {
                        annotations.insert(MESH_INJECT_ANNOTATION.to_string(), value);
                        changed = true;
                    }
                }
                None => {
                    if annotations.remove(MESH_INJECT_ANNOTATION).is_some() {
                        changed = true;
                    }
                }
            }
        }

        // The workload container and its volumes.
        let des_pod = des_template.spec.as_ref();
        let obs_pod = obs_spec.template.spec.as_mut();
        if let (Some(obs_pod), Some(des_pod)) = (obs_pod, des_pod) {
            if let Some(des_container) = des_pod.containers.first() {
                match obs_pod
                    .containers
                    .iter_mut()
                    .find(|c| c.name == des_container.name)
                {
                    Some(obs_container) => {
                        changed |= merge_container(obs_container, des_container);
                    }
                    None => {
                        obs_pod.containers = des_pod.containers.clone();
                        changed = true;
                    }
                }
            }

            let obs_volumes: Vec<(String, Option<String>)> = volume_projection(&obs_pod.volumes);
            let des_volumes: Vec<(String, Option<String>)> = volume_projection(&des_pod.volumes);
            if obs_volumes != des_volumes {
                obs_pod.volumes = des_pod.volumes.clone();
                changed = true;
            }
        }
    }

    changed.then_some(updated)
}

fn merge_container(observed: &mut Container, desired: &Container) -> bool {
    let mut changed = false;

    if observed.image != desired.image {
        observed.image = desired.image.clone();
        changed = true;
    }
    if observed.env != desired.env {
        observed.env = desired.env.clone();
        changed = true;
    }

    let port_projection = |c: &Container| -> Vec<(Option<String>, i32)> {
        c.ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|p| (p.name.clone(), p.container_port))
            .collect()
    };
    if port_projection(observed) != port_projection(desired) {
        observed.ports = desired.ports.clone();
        changed = true;
    }

    if probe_drifted(&observed.liveness_probe, &desired.liveness_probe) {
        observed.liveness_probe = desired.liveness_probe.clone();
        changed = true;
    }
    if probe_drifted(&observed.readiness_probe, &desired.readiness_probe) {
        observed.readiness_probe = desired.readiness_probe.clone();
        changed = true;
    }

    let mount_projection = |c: &Container| -> Vec<(String, String)> {
        c.volume_mounts
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|m| (m.name.clone(), m.mount_path.clone()))
            .collect()
    };
    if mount_projection(observed) != mount_projection(desired) {
        observed.volume_mounts = desired.volume_mounts.clone();
        changed = true;
    }

    changed
}

fn probe_drifted(observed: &Option<Probe>, desired: &Option<Probe>) -> bool {
    let projection = |p: &Option<Probe>| {
        p.as_ref()
            .and_then(|p| p.http_get.as_ref())
            .map(|h| (h.path.clone(), h.port.clone()))
    };
    projection(observed) != projection(desired)
}

fn volume_projection(
    volumes: &Option<Vec<k8s_openapi::api::core::v1::Volume>>,
) -> Vec<(String, Option<String>)> {
    volumes
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|v| {
            (
                v.name.clone(),
                v.config_map.as_ref().and_then(|cm| cm.name.clone()),
            )
        })
        .collect()
}

fn merge_service(observed: &Service, desired: &Service) -> Option<Service> {
    let mut updated = observed.clone();
    let mut changed = overlay_labels(&mut updated.metadata, &desired.metadata);

    let port_projection = |spec: &k8s_openapi::api::core::v1::ServiceSpec| {
        spec.ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|p| (p.name.clone(), p.port, p.target_port.clone()))
            .collect::<Vec<_>>()
    };

    if let (Some(obs_spec), Some(des_spec)) = (updated.spec.as_mut(), desired.spec.as_ref()) {
        if obs_spec.selector != des_spec.selector {
            obs_spec.selector = des_spec.selector.clone();
            changed = true;
        }
        if port_projection(obs_spec) != port_projection(des_spec) {
            obs_spec.ports = des_spec.ports.clone();
            changed = true;
        }
    }

    changed.then_some(updated)
}

fn merge_config_map(observed: &ConfigMap, desired: &ConfigMap) -> Option<ConfigMap> {
    let mut updated = observed.clone();
    let mut changed = overlay_labels(&mut updated.metadata, &desired.metadata);

    if updated.data != desired.data {
        updated.data = desired.data.clone();
        changed = true;
    }

    changed.then_some(updated)
}

fn merge_route(observed: &Route, desired: &Route) -> Option<Route> {
    let mut updated = observed.clone();
    let mut changed = overlay_labels(&mut updated.metadata, &desired.metadata);

    // The router owns `host`; only target and port are ours.
    if updated.spec.to != desired.spec.to {
        updated.spec.to = desired.spec.to.clone();
        changed = true;
    }
    if updated.spec.port != desired.spec.port {
        updated.spec.port = desired.spec.port.clone();
        changed = true;
    }

    changed.then_some(updated)
}

fn merge_image_stream(observed: &ImageStream, desired: &ImageStream) -> Option<ImageStream> {
    let mut updated = observed.clone();
    let mut changed = overlay_labels(&mut updated.metadata, &desired.metadata);

    if updated.spec.tags != desired.spec.tags {
        updated.spec.tags = desired.spec.tags.clone();
        changed = true;
    }

    changed.then_some(updated)
}

/// Ensure every desired label is present with the desired value; labels set
/// by other actors are left in place.
fn overlay_labels(observed: &mut ObjectMeta, desired: &ObjectMeta) -> bool {
    let Some(desired_labels) = desired.labels.as_ref() else {
        return false;
    };
    let labels = observed.labels.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (k, v) in desired_labels {
        if labels.get(k) != Some(v) {
            labels.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::HealthProbeStyle;
    use crate::crd::InsightServiceSpec;

    fn declaration(replicas: Option<i32>) -> InsightService {
        let mut service = InsightService::new(
            "audit",
            InsightServiceSpec {
                image: Some("registry/app:1.0".to_string()),
                replicas,
                ..serde_json::from_str("{}").expect("defaults parse")
            },
        );
        service.metadata.namespace = Some("team-a".to_string());
        service.metadata.uid = Some("uid-1".to_string());
        service
    }

    fn definition() -> ServiceDefinition {
        ServiceDefinition {
            default_image: "quay.io/insight/insight-service:latest".to_string(),
            message_topics: vec![],
            requires_messaging: false,
            requires_persistence: false,
            health_probe: HealthProbeStyle::Quarkus,
            endpoint_env_var: None,
        }
    }

    fn built_deployment(replicas: Option<i32>) -> Deployment {
        resources::build_deployment(&declaration(replicas), &definition(), &BuildInputs::default())
            .expect("builds")
    }

    #[test]
    fn identical_deployments_produce_no_update() {
        let desired = built_deployment(None);
        assert!(merge_deployment(&desired, &desired).is_none());
    }

    #[test]
    fn external_replica_drift_is_preserved() {
        let desired = built_deployment(None);
        let mut observed = desired.clone();
        observed.spec.as_mut().unwrap().replicas = Some(4);

        // Recorded declared count still matches the declaration: the drift
        // belongs to an external scaler.
        assert!(merge_deployment(&observed, &desired).is_none());
    }

    #[test]
    fn declared_replica_change_wins_over_drift() {
        let mut observed = built_deployment(None);
        observed.spec.as_mut().unwrap().replicas = Some(4);
        let desired = built_deployment(Some(2));

        let updated = merge_deployment(&observed, &desired).expect("update needed");
        assert_eq!(updated.spec.as_ref().unwrap().replicas, Some(2));
        let recorded = updated
            .metadata
            .annotations
            .unwrap()
            .remove(DECLARED_REPLICAS_ANNOTATION)
            .unwrap();
        assert_eq!(recorded, "2");
    }

    #[test]
    fn owned_image_drift_is_corrected_only() {
        let desired = built_deployment(None);
        let mut observed = desired.clone();
        {
            let spec = observed.spec.as_mut().unwrap();
            spec.replicas = Some(7);
            spec.template.spec.as_mut().unwrap().containers[0].image =
                Some("registry/rogue:2.0".to_string());
        }

        let updated = merge_deployment(&observed, &desired).expect("update needed");
        let spec = updated.spec.unwrap();
        assert_eq!(spec.replicas, Some(7));
        assert_eq!(
            spec.template.spec.unwrap().containers[0].image.as_deref(),
            Some("registry/app:1.0")
        );
    }

    #[test]
    fn server_defaulted_probe_fields_are_not_drift() {
        let desired = built_deployment(None);
        let mut observed = desired.clone();
        {
            let container = &mut observed.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0];
            let probe = container.liveness_probe.as_mut().unwrap();
            probe.timeout_seconds = Some(1);
            probe.success_threshold = Some(1);
        }
        assert!(merge_deployment(&observed, &desired).is_none());
    }

    #[test]
    fn route_host_is_never_reclaimed() {
        let service = declaration(None);
        let desired = resources::build_route(&service);
        let mut observed = desired.clone();
        observed.spec.host = Some("audit.apps.example.com".to_string());

        assert!(merge_route(&observed, &desired).is_none());
    }
}
