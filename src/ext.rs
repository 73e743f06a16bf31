//! Typed access to optional API extension groups.
//!
//! Routes (`route.openshift.io`) and image streams (`image.openshift.io`)
//! exist only in clusters that ship those extensions. The types here cover
//! the fields this operator reads and writes; availability of the groups is
//! negotiated once at startup, see [`crate::capabilities`].

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Route exposes a Service on an externally reachable host.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Externally reachable host. Left unset so the router assigns one;
    /// the assigned value is never reclaimed by this operator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Target of the route.
    pub to: RouteTargetReference,

    /// Target port on the backing service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<RoutePort>,
}

/// Backend a Route points at.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    /// Backend kind; always `Service` here.
    pub kind: String,
    /// Backend name.
    pub name: String,
    /// Traffic weight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

/// Port selection for a Route.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePort {
    /// Name or number of the service port to target.
    pub target_port: String,
}

/// ImageStream tracks metadata about the workload's container image.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "image.openshift.io",
    version = "v1",
    kind = "ImageStream",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamSpec {
    /// Tags tracked by this stream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<TagReference>,
}

/// One tracked image tag.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagReference {
    /// Tag name within the stream.
    pub name: String,

    /// Source image the tag tracks.
    pub from: TagReferenceFrom,

    /// Import policy for the tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_policy: Option<TagImportPolicy>,
}

/// Source of a tracked tag.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagReferenceFrom {
    /// Source kind; always `DockerImage` here.
    pub kind: String,
    /// Full image reference.
    pub name: String,
}

/// Import policy for a tracked tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagImportPolicy {
    /// Allow importing from registries without valid TLS.
    #[serde(default)]
    pub insecure: bool,
}
