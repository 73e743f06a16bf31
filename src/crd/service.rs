//! InsightService Custom Resource Definition.
//!
//! Declares one managed analytics workload. The operator converges a
//! Deployment, a Service, a properties ConfigMap and, where the cluster
//! supports them, a Route and an ImageStream to this declaration.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Conventional name of the infrastructure object a declaration binds to
/// when `spec.infra` is left unset.
pub const DEFAULT_INFRA_NAME: &str = "insight-infra";

/// InsightService is the Schema for the insightservices API.
///
/// An InsightService describes the desired state of one decision-insight
/// workload. The `status` sub-object is written exclusively by the operator;
/// the rest of the object belongs to the author.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "insight.dev",
    version = "v1alpha1",
    kind = "InsightService",
    plural = "insightservices",
    shortname = "ins",
    namespaced,
    status = "InsightServiceStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Runtime", "type":"string", "jsonPath":".spec.runtime"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InsightServiceSpec {
    /// Container image to run. When set it is used verbatim and no image
    /// lookup of any kind happens; when unset the operator falls back to the
    /// workload type's default image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Runtime flavor of the workload, drives health-check conventions and
    /// configuration defaults.
    #[serde(default)]
    pub runtime: RuntimeKind,

    /// Desired replica count. Defaults to 1. After creation, replica counts
    /// changed by external scalers are respected until this field changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// HTTP port the workload serves on.
    #[serde(default = "default_http_port")]
    pub http_port: i32,

    /// Inject the service-mesh sidecar into workload pods.
    #[serde(default)]
    pub enable_service_mesh: bool,

    /// Allow pulling the image from an insecure registry.
    #[serde(default)]
    pub insecure_image_registry: bool,

    /// Environment for the workload container, in declared order. Duplicate
    /// names are rejected at reconcile time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,

    /// Name of an externally supplied ConfigMap whose
    /// `application.properties` content is materialized verbatim into the
    /// workload's configuration bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties_config_map: Option<String>,

    /// Inline configuration properties, merged over the runtime defaults.
    /// Ignored when `propertiesConfigMap` is set.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,

    /// Additional messaging topics this instance consumes, on top of the
    /// topics the workload type always requires.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_topics: Vec<String>,

    /// Name of the InsightInfra object providing messaging and persistence.
    /// Defaults to `insight-infra`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infra: Option<String>,

    /// Expose the workload through a Route when the cluster supports routes.
    #[serde(default = "default_true")]
    pub expose_route: bool,

    /// Publish this workload's cluster-internal address into sibling
    /// declarations in the same namespace. At most one declaration per
    /// namespace should publish.
    #[serde(default)]
    pub publish_endpoint: bool,
}

fn default_http_port() -> i32 {
    8080
}

fn default_true() -> bool {
    true
}

impl InsightServiceSpec {
    /// Effective replica count, defaulting to 1.
    pub fn replicas_or_default(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    /// Name of the bound infrastructure object.
    pub fn infra_name(&self) -> &str {
        self.infra.as_deref().unwrap_or(DEFAULT_INFRA_NAME)
    }
}

/// Supported runtime flavors.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Quarkus-based runtime.
    #[default]
    Quarkus,
    /// Spring Boot-based runtime.
    SpringBoot,
}

/// One environment entry: either a plain value or a secret key reference.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSpec {
    /// Variable name.
    pub name: String,

    /// Plain value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Secret reference; takes precedence over `value` when both are set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyRef>,
}

impl EnvVarSpec {
    /// Plain key/value entry.
    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            secret_key_ref: None,
        }
    }

    /// Secret-referenced entry.
    pub fn secret(name: impl Into<String>, secret: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            secret_key_ref: Some(SecretKeyRef {
                name: secret.into(),
                key: key.into(),
            }),
        }
    }
}

/// Reference to a single key of a Secret.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name.
    pub name: String,
    /// Key within the secret.
    pub key: String,
}

/// InsightService status, written only by the operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InsightServiceStatus {
    /// Current convergence phase.
    #[serde(default)]
    pub phase: ServicePhase,

    /// Number of ready workload replicas.
    #[serde(default)]
    pub ready_replicas: i32,

    /// Cluster-internal endpoint of the workload once it is reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Human-readable message about the current state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the declaration this status reflects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the status was updated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Convergence phase of a declaration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ServicePhase {
    /// Not yet reconciled.
    #[default]
    Pending,
    /// Dependents created, waiting for readiness or infrastructure.
    Provisioning,
    /// All mandatory dependents ready.
    Running,
    /// Declaration is invalid and needs an edit.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_spec_defaults() {
        let spec: InsightServiceSpec = serde_json::from_str("{}").expect("empty spec parses");

        assert_eq!(spec.runtime, RuntimeKind::Quarkus);
        assert_eq!(spec.replicas_or_default(), 1);
        assert_eq!(spec.http_port, 8080);
        assert!(!spec.enable_service_mesh);
        assert!(!spec.insecure_image_registry);
        assert!(spec.expose_route);
        assert_eq!(spec.infra_name(), DEFAULT_INFRA_NAME);
    }

    #[test]
    fn env_entry_serialization() {
        let spec: InsightServiceSpec = serde_json::from_value(serde_json::json!({
            "image": "registry/app:1.0",
            "env": [
                {"name": "MODE", "value": "audit"},
                {"name": "TOKEN", "secretKeyRef": {"name": "creds", "key": "token"}},
            ],
        }))
        .expect("spec parses");

        assert_eq!(spec.env.len(), 2);
        assert_eq!(spec.env[0], EnvVarSpec::value("MODE", "audit"));
        assert_eq!(spec.env[1], EnvVarSpec::secret("TOKEN", "creds", "token"));
    }
}
