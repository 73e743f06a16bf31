//! Desired-state builders for dependent objects.
//!
//! Pure functions mapping one [`InsightService`] declaration (plus inputs the
//! deployer pre-fetched) to the dependent objects that realize it. Builders
//! have no side effects and are deterministic, so the deployer can re-run
//! them for diffing and always get the same answer.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, Probe,
    SecretKeySelector, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::core::v1::{HTTPGetAction, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::capabilities::Capabilities;
use crate::controller::ServiceDefinition;
use crate::crd::{DatastoreStatus, InsightService, MessagingStatus};
use crate::error::{OperatorError, OperatorResult};
use crate::ext::{
    ImageStream, ImageStreamSpec, Route, RoutePort, RouteSpec, RouteTargetReference,
    TagImportPolicy, TagReference, TagReferenceFrom,
};
use crate::store::DependentObject;

/// Key under which properties content is stored in the config bundle.
pub const PROPERTIES_FILE_KEY: &str = "application.properties";

/// Annotation recording the replica count last asserted from the
/// declaration; drift from this value is an external scaler's choice.
pub const DECLARED_REPLICAS_ANNOTATION: &str = "insight.dev/declared-replicas";

/// Pod template annotation enabling mesh sidecar injection.
pub const MESH_INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";

/// Env var carrying the messaging bootstrap address.
pub const ENV_MESSAGING_BOOTSTRAP: &str = "KAFKA_BOOTSTRAP_SERVERS";

/// Env var carrying the comma-separated topic list.
pub const ENV_MESSAGING_TOPICS: &str = "INSIGHT_MESSAGING_TOPICS";

/// Env var carrying the datastore connection URI.
pub const ENV_DATASTORE_URI: &str = "INSIGHT_DATASTORE_URI";

/// Env var carrying the datastore username, referenced from the
/// infrastructure credentials secret.
pub const ENV_DATASTORE_USERNAME: &str = "INSIGHT_DATASTORE_USERNAME";

/// Env var carrying the datastore password, referenced from the
/// infrastructure credentials secret.
pub const ENV_DATASTORE_PASSWORD: &str = "INSIGHT_DATASTORE_PASSWORD";

const CONTAINER_NAME: &str = "service";
const HTTP_PORT_NAME: &str = "http";
const PROPERTIES_VOLUME: &str = "app-properties";
const PROPERTIES_MOUNT_PATH: &str = "/deployments/config";

/// Cluster state the builder needs but must not fetch itself.
#[derive(Debug, Clone, Default)]
pub struct BuildInputs {
    /// Content of the externally referenced properties bundle, verbatim.
    pub external_properties: Option<String>,
    /// Messaging subsystem, when provisioned.
    pub messaging: Option<MessagingStatus>,
    /// Datastore subsystem, when provisioned.
    pub datastore: Option<DatastoreStatus>,
}

/// Name of the configuration bundle owned by a declaration.
pub fn config_map_name(service_name: &str) -> String {
    format!("{service_name}-properties")
}

/// Cluster-internal endpoint of the workload.
pub fn internal_endpoint(name: &str, namespace: &str, port: i32) -> String {
    format!("http://{name}.{namespace}.svc:{port}")
}

/// Effective container image: the declaration's verbatim when set, else the
/// workload type's default. A directly specified image skips any lookup.
pub fn effective_image(service: &InsightService, definition: &ServiceDefinition) -> String {
    service
        .spec
        .image
        .clone()
        .unwrap_or_else(|| definition.default_image.clone())
}

/// Topics this instance requires: the workload type's topics plus the
/// declaration's extras, first occurrence wins.
pub fn required_topics(service: &InsightService, definition: &ServiceDefinition) -> Vec<String> {
    let mut seen = HashSet::new();
    definition
        .message_topics
        .iter()
        .chain(service.spec.extra_topics.iter())
        .filter(|t| seen.insert(t.as_str().to_string()))
        .cloned()
        .collect()
}

/// Build the full ordered dependent set for one declaration.
///
/// Optional kinds are attached only when their API group is available and
/// the corresponding feature is enabled on the declaration.
pub fn build_dependents(
    service: &InsightService,
    definition: &ServiceDefinition,
    capabilities: Capabilities,
    inputs: &BuildInputs,
) -> OperatorResult<Vec<DependentObject>> {
    let mut dependents = vec![
        DependentObject::ConfigMap(build_config_map(service, inputs)),
        DependentObject::Service(build_service(service)),
        DependentObject::Deployment(build_deployment(service, definition, inputs)?),
    ];

    if capabilities.routes && service.spec.expose_route {
        dependents.push(DependentObject::Route(build_route(service)));
    }
    if capabilities.image_streams {
        dependents.push(DependentObject::ImageStream(build_image_stream(
            service, definition,
        )));
    }

    Ok(dependents)
}

/// Build the configuration bundle.
///
/// An externally referenced bundle is materialized verbatim; otherwise the
/// inline properties are merged over the runtime's conventional defaults.
pub fn build_config_map(service: &InsightService, inputs: &BuildInputs) -> ConfigMap {
    let name = service.name_unchecked();
    let content = match &inputs.external_properties {
        Some(external) => external.clone(),
        None => render_properties(service),
    };

    ConfigMap {
        metadata: owned_meta(service, config_map_name(&name)),
        data: Some(BTreeMap::from([(PROPERTIES_FILE_KEY.to_string(), content)])),
        ..Default::default()
    }
}

fn render_properties(service: &InsightService) -> String {
    let port = service.spec.http_port;
    let defaults: &[(&str, String)] = &match service.spec.runtime {
        crate::crd::RuntimeKind::Quarkus => [
            ("quarkus.http.host", "0.0.0.0".to_string()),
            ("quarkus.http.port", port.to_string()),
        ],
        crate::crd::RuntimeKind::SpringBoot => [
            ("server.address", "0.0.0.0".to_string()),
            ("server.port", port.to_string()),
        ],
    };

    let mut merged: BTreeMap<String, String> = defaults
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    merged.extend(
        service
            .spec
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    let mut out = String::new();
    for (key, value) in &merged {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Build the network-exposing service.
pub fn build_service(service: &InsightService) -> Service {
    let name = service.name_unchecked();
    Service {
        metadata: owned_meta(service, name.clone()),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.to_string()),
                port: service.spec.http_port,
                target_port: Some(IntOrString::Int(service.spec.http_port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the workload deployment.
pub fn build_deployment(
    service: &InsightService,
    definition: &ServiceDefinition,
    inputs: &BuildInputs,
) -> OperatorResult<Deployment> {
    let name = service.name_unchecked();
    let replicas = service.spec.replicas_or_default();
    let env = resolve_env(service, definition, inputs)?;
    let image = effective_image(service, definition);

    let mut metadata = owned_meta(service, name.clone());
    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(DECLARED_REPLICAS_ANNOTATION.to_string(), replicas.to_string());

    let mut template_annotations = BTreeMap::new();
    if service.spec.enable_service_mesh {
        template_annotations.insert(MESH_INJECT_ANNOTATION.to_string(), "true".to_string());
    }

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            name: Some(HTTP_PORT_NAME.to_string()),
            container_port: service.spec.http_port,
            ..Default::default()
        }]),
        liveness_probe: Some(http_probe(
            definition.health_probe.liveness_path(),
            service.spec.http_port,
        )),
        readiness_probe: Some(http_probe(
            definition.health_probe.readiness_path(),
            service.spec.http_port,
        )),
        volume_mounts: Some(vec![VolumeMount {
            name: PROPERTIES_VOLUME.to_string(),
            mount_path: PROPERTIES_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(workload_labels(&name)),
                    annotations: (!template_annotations.is_empty()).then_some(template_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: PROPERTIES_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(config_map_name(&name)),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Build the external route (optional networking group).
pub fn build_route(service: &InsightService) -> Route {
    let name = service.name_unchecked();
    let mut route = Route::new(
        &name,
        RouteSpec {
            host: None,
            to: RouteTargetReference {
                kind: "Service".to_string(),
                name: name.clone(),
                weight: Some(100),
            },
            port: Some(RoutePort {
                target_port: HTTP_PORT_NAME.to_string(),
            }),
        },
    );
    route.metadata = owned_meta(service, name);
    route
}

/// Build the image metadata object (optional image group).
pub fn build_image_stream(service: &InsightService, definition: &ServiceDefinition) -> ImageStream {
    let name = service.name_unchecked();
    let image = effective_image(service, definition);
    let mut stream = ImageStream::new(
        &name,
        ImageStreamSpec {
            tags: vec![TagReference {
                name: image_tag(&image).to_string(),
                from: TagReferenceFrom {
                    kind: "DockerImage".to_string(),
                    name: image,
                },
                import_policy: Some(TagImportPolicy {
                    insecure: service.spec.insecure_image_registry,
                }),
            }],
        },
    );
    stream.metadata = owned_meta(service, name);
    stream
}

/// Resolve the container environment: declared entries in order, then the
/// infrastructure-provided bindings for any name the author did not claim.
/// Duplicate declared names are a validation error.
pub fn resolve_env(
    service: &InsightService,
    definition: &ServiceDefinition,
    inputs: &BuildInputs,
) -> OperatorResult<Vec<EnvVar>> {
    let mut names = HashSet::new();
    let mut env = Vec::with_capacity(service.spec.env.len());

    for entry in &service.spec.env {
        if !names.insert(entry.name.clone()) {
            return Err(OperatorError::Validation(format!(
                "duplicate environment variable '{}'",
                entry.name
            )));
        }
        env.push(match &entry.secret_key_ref {
            Some(secret_ref) => secret_env(&entry.name, &secret_ref.name, &secret_ref.key),
            None => plain_env(&entry.name, entry.value.clone().unwrap_or_default()),
        });
    }

    let mut push_new = |var: EnvVar| {
        if names.insert(var.name.clone()) {
            env.push(var);
        }
    };

    if let Some(messaging) = &inputs.messaging {
        push_new(plain_env(
            ENV_MESSAGING_BOOTSTRAP,
            messaging.bootstrap_servers.clone(),
        ));
        push_new(plain_env(
            ENV_MESSAGING_TOPICS,
            required_topics(service, definition).join(","),
        ));
    }

    if let Some(datastore) = &inputs.datastore {
        push_new(plain_env(ENV_DATASTORE_URI, datastore.service_uri.clone()));
        if let Some(secret) = &datastore.credentials_secret {
            push_new(secret_env(ENV_DATASTORE_USERNAME, secret, "username"));
            push_new(secret_env(ENV_DATASTORE_PASSWORD, secret, "password"));
        }
    }

    Ok(env)
}

fn plain_env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

fn http_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(10),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn workload_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(name);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "insight-operator".to_string(),
    );
    labels
}

fn owned_meta(service: &InsightService, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: service.metadata.namespace.clone(),
        labels: Some(workload_labels(&service.name_unchecked())),
        owner_references: service.controller_owner_ref(&()).map(|or| vec![or]),
        ..Default::default()
    }
}

fn image_tag(image: &str) -> &str {
    let after_slash = image.rsplit('/').next().unwrap_or(image);
    match after_slash.split_once(':') {
        Some((_, tag)) if !tag.is_empty() => tag,
        _ => "latest",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{HealthProbeStyle, ServiceDefinition};
    use crate::crd::{EnvVarSpec, InsightServiceSpec};

    fn declaration(name: &str) -> InsightService {
        let mut service = InsightService::new(
            name,
            InsightServiceSpec {
                image: Some("registry/app:1.0".to_string()),
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
            message_topics: vec!["insight-decision-events".to_string()],
            requires_messaging: true,
            requires_persistence: true,
            health_probe: HealthProbeStyle::Quarkus,
            endpoint_env_var: None,
        }
    }

    #[test]
    fn builder_is_deterministic() {
        let service = declaration("audit");
        let first = build_dependents(&service, &definition(), Capabilities::all(), &BuildInputs::default())
            .expect("builds");
        let second = build_dependents(&service, &definition(), Capabilities::all(), &BuildInputs::default())
            .expect("builds");
        assert_eq!(first, second);
    }

    #[test]
    fn defaults_replicas_and_port() {
        let service = declaration("audit");
        let deployment =
            build_deployment(&service, &definition(), &BuildInputs::default()).expect("builds");
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));

        let svc = build_service(&service);
        let port = &svc.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 8080);
    }

    #[test]
    fn declared_image_used_verbatim() {
        let service = declaration("audit");
        let deployment =
            build_deployment(&service, &definition(), &BuildInputs::default()).expect("builds");
        let image = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .image
            .clone();
        assert_eq!(image.as_deref(), Some("registry/app:1.0"));
    }

    #[test]
    fn duplicate_env_names_rejected() {
        let mut service = declaration("audit");
        service.spec.env = vec![
            EnvVarSpec::value("MODE", "a"),
            EnvVarSpec::value("MODE", "b"),
        ];
        let err = resolve_env(&service, &definition(), &BuildInputs::default()).unwrap_err();
        assert!(matches!(err, OperatorError::Validation(_)));
    }

    #[test]
    fn declared_env_order_preserved_and_secret_refs_mapped() {
        let mut service = declaration("audit");
        service.spec.env = vec![
            EnvVarSpec::value("FIRST", "1"),
            EnvVarSpec::secret("SECOND", "creds", "token"),
        ];
        let env = resolve_env(&service, &definition(), &BuildInputs::default()).expect("resolves");
        assert_eq!(env[0].name, "FIRST");
        assert_eq!(env[1].name, "SECOND");
        let secret_ref = env[1]
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
            .expect("secret ref");
        assert_eq!(secret_ref.name.as_deref(), Some("creds"));
        assert_eq!(secret_ref.key, "token");
    }

    #[test]
    fn infra_env_injected_without_clobbering_user_entries() {
        let mut service = declaration("audit");
        service.spec.env = vec![EnvVarSpec::value(ENV_MESSAGING_BOOTSTRAP, "my-own:9092")];
        let inputs = BuildInputs {
            messaging: Some(MessagingStatus {
                bootstrap_servers: "infra-kafka:9092".to_string(),
                provisioned_topics: vec![],
            }),
            ..Default::default()
        };
        let env = resolve_env(&service, &definition(), &inputs).expect("resolves");
        let bootstrap: Vec<_> = env
            .iter()
            .filter(|e| e.name == ENV_MESSAGING_BOOTSTRAP)
            .collect();
        assert_eq!(bootstrap.len(), 1);
        assert_eq!(bootstrap[0].value.as_deref(), Some("my-own:9092"));
        assert!(env.iter().any(|e| e.name == ENV_MESSAGING_TOPICS));
    }

    #[test]
    fn external_properties_materialized_verbatim() {
        let service = declaration("audit");
        let inputs = BuildInputs {
            external_properties: Some("key=value\n".to_string()),
            ..Default::default()
        };
        let cm = build_config_map(&service, &inputs);
        assert_eq!(
            cm.data.unwrap().get(PROPERTIES_FILE_KEY).map(String::as_str),
            Some("key=value\n")
        );
    }

    #[test]
    fn inline_properties_merge_over_runtime_defaults() {
        let mut service = declaration("audit");
        service
            .spec
            .properties
            .insert("quarkus.http.port".to_string(), "9000".to_string());
        service
            .spec
            .properties
            .insert("my.flag".to_string(), "on".to_string());
        let cm = build_config_map(&service, &BuildInputs::default());
        let content = cm.data.unwrap().remove(PROPERTIES_FILE_KEY).unwrap();
        assert!(content.contains("quarkus.http.host=0.0.0.0\n"));
        assert!(content.contains("quarkus.http.port=9000\n"));
        assert!(content.contains("my.flag=on\n"));
    }

    #[test]
    fn route_omitted_without_capability_or_toggle() {
        let service = declaration("audit");

        let without_group = build_dependents(
            &service,
            &definition(),
            Capabilities::none(),
            &BuildInputs::default(),
        )
        .expect("builds");
        assert!(!without_group
            .iter()
            .any(|d| matches!(d, DependentObject::Route(_))));

        let mut toggled_off = declaration("audit");
        toggled_off.spec.expose_route = false;
        let with_group = build_dependents(
            &toggled_off,
            &definition(),
            Capabilities::all(),
            &BuildInputs::default(),
        )
        .expect("builds");
        assert!(!with_group
            .iter()
            .any(|d| matches!(d, DependentObject::Route(_))));
    }

    #[test]
    fn image_stream_honours_insecure_registry() {
        let mut service = declaration("audit");
        service.spec.insecure_image_registry = true;
        let stream = build_image_stream(&service, &definition());
        let tag = &stream.spec.tags[0];
        assert_eq!(tag.name, "1.0");
        assert_eq!(tag.from.name, "registry/app:1.0");
        assert!(tag.import_policy.as_ref().unwrap().insecure);
    }

    #[test]
    fn probe_paths_follow_health_style() {
        let service = declaration("audit");
        let mut def = definition();
        def.health_probe = HealthProbeStyle::SpringBoot;
        let deployment = build_deployment(&service, &def, &BuildInputs::default()).expect("builds");
        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        let liveness = container
            .liveness_probe
            .as_ref()
            .and_then(|p| p.http_get.as_ref())
            .and_then(|h| h.path.as_deref());
        assert_eq!(liveness, Some("/actuator/health/liveness"));
    }

    #[test]
    fn mesh_annotation_follows_toggle() {
        let mut service = declaration("audit");
        service.spec.enable_service_mesh = true;
        let deployment =
            build_deployment(&service, &definition(), &BuildInputs::default()).expect("builds");
        let annotations = deployment
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap();
        assert_eq!(annotations.get(MESH_INJECT_ANNOTATION).map(String::as_str), Some("true"));
    }
}
