//! InsightInfra Custom Resource Definition.
//!
//! Describes the shared infrastructure (messaging, datastore) Insight
//! workloads in a namespace depend on. This operator only reads it: a
//! separate provisioner owns the object and fills in its status as the
//! subsystems come up.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// InsightInfra is the Schema for the insightinfras API.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "insight.dev",
    version = "v1alpha1",
    kind = "InsightInfra",
    plural = "insightinfras",
    namespaced,
    status = "InsightInfraStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Messaging", "type":"boolean", "jsonPath":".spec.provisionMessaging"}"#,
    printcolumn = r#"{"name":"Datastore", "type":"boolean", "jsonPath":".spec.provisionDatastore"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InsightInfraSpec {
    /// Provision a messaging broker for this namespace.
    #[serde(default)]
    pub provision_messaging: bool,

    /// Provision a datastore for this namespace.
    #[serde(default)]
    pub provision_datastore: bool,
}

/// InsightInfra status, filled in by the infrastructure provisioner.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InsightInfraStatus {
    /// Messaging subsystem, present once provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messaging: Option<MessagingStatus>,

    /// Datastore subsystem, present once provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datastore: Option<DatastoreStatus>,
}

/// Provisioned messaging subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagingStatus {
    /// Broker bootstrap address, e.g. `insight-kafka:9092`.
    pub bootstrap_servers: String,

    /// Topics the provisioner has created so far.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provisioned_topics: Vec<String>,
}

impl MessagingStatus {
    /// Whether every topic in `required` has been provisioned.
    pub fn covers<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> bool {
        required
            .into_iter()
            .all(|topic| self.provisioned_topics.iter().any(|t| t == topic))
    }
}

/// Provisioned datastore subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreStatus {
    /// Connection URI of the datastore service.
    pub service_uri: String,

    /// Secret holding `username`/`password` credentials for the datastore.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,
}
