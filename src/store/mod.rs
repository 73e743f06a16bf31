//! Typed access to cluster state.
//!
//! The reconciliation engine never talks to the API server directly; it goes
//! through the [`ResourceStore`] trait so tests can drive passes against an
//! in-memory double. [`KubeStore`] is the production implementation.
//!
//! Identity is (kind, namespace, name). Updates are optimistic: a write
//! against a stale version fails with [`StoreError::Conflict`], as does a
//! create that races another writer; create-if-absent is the enforcement
//! point for the one-dependent-set-per-declaration guarantee.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::capabilities::Capabilities;
use crate::crd::{InsightInfra, InsightService, InsightServiceStatus};
use crate::error::StoreError;
use crate::ext::{ImageStream, Route};

#[cfg(test)]
pub(crate) mod memory;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Kinds of dependent objects the engine can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependentKind {
    /// apps/v1 Deployment running the workload.
    Deployment,
    /// core/v1 Service exposing the workload.
    Service,
    /// core/v1 ConfigMap carrying the materialized properties.
    ConfigMap,
    /// route.openshift.io/v1 Route (optional group).
    Route,
    /// image.openshift.io/v1 ImageStream (optional group).
    ImageStream,
}

impl DependentKind {
    /// Kind name as it appears in the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            DependentKind::Deployment => "Deployment",
            DependentKind::Service => "Service",
            DependentKind::ConfigMap => "ConfigMap",
            DependentKind::Route => "Route",
            DependentKind::ImageStream => "ImageStream",
        }
    }
}

impl std::fmt::Display for DependentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one dependent object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Object kind.
    pub kind: DependentKind,
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl ObjectKey {
    /// Build a key.
    pub fn new(kind: DependentKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// One dependent object, carrying its full typed representation.
#[derive(Debug, Clone, PartialEq)]
pub enum DependentObject {
    /// Workload deployment.
    Deployment(Deployment),
    /// Network-exposing service.
    Service(Service),
    /// Configuration bundle.
    ConfigMap(ConfigMap),
    /// Optional external route.
    Route(Route),
    /// Optional image metadata.
    ImageStream(ImageStream),
}

impl DependentObject {
    /// Kind of the wrapped object.
    pub fn kind(&self) -> DependentKind {
        match self {
            DependentObject::Deployment(_) => DependentKind::Deployment,
            DependentObject::Service(_) => DependentKind::Service,
            DependentObject::ConfigMap(_) => DependentKind::ConfigMap,
            DependentObject::Route(_) => DependentKind::Route,
            DependentObject::ImageStream(_) => DependentKind::ImageStream,
        }
    }

    /// Shared object metadata.
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            DependentObject::Deployment(o) => &o.metadata,
            DependentObject::Service(o) => &o.metadata,
            DependentObject::ConfigMap(o) => &o.metadata,
            DependentObject::Route(o) => &o.metadata,
            DependentObject::ImageStream(o) => &o.metadata,
        }
    }

    /// Mutable shared object metadata.
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            DependentObject::Deployment(o) => &mut o.metadata,
            DependentObject::Service(o) => &mut o.metadata,
            DependentObject::ConfigMap(o) => &mut o.metadata,
            DependentObject::Route(o) => &mut o.metadata,
            DependentObject::ImageStream(o) => &mut o.metadata,
        }
    }

    /// Identity of the wrapped object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.kind(),
            self.meta().namespace.clone().unwrap_or_default(),
            self.meta().name.clone().unwrap_or_default(),
        )
    }

    /// Whether this object has a controller owner reference with `uid`.
    pub fn is_controlled_by(&self, uid: &str) -> bool {
        self.meta()
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|or| or.controller == Some(true) && or.uid == uid)
    }
}

/// Typed CRUD and list access to the cluster's object store.
///
/// All operations are namespace-scoped. `fetch` treats absence as `Ok(None)`,
/// never as an error; `create` and `update` report stale-version races as
/// [`StoreError::Conflict`].
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// List the service declarations in a namespace.
    async fn list_declarations(&self, namespace: &str) -> StoreResult<Vec<InsightService>>;

    /// Replace a declaration (used for cross-declaration endpoint
    /// propagation; optimistic).
    async fn update_declaration(&self, declaration: &InsightService) -> StoreResult<()>;

    /// Patch the status sub-object of a declaration.
    async fn patch_declaration_status(
        &self,
        namespace: &str,
        name: &str,
        status: &InsightServiceStatus,
    ) -> StoreResult<()>;

    /// Fetch an infrastructure object.
    async fn get_infra(&self, namespace: &str, name: &str) -> StoreResult<Option<InsightInfra>>;

    /// Fetch an externally supplied ConfigMap (a properties bundle the
    /// engine does not own).
    async fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>>;

    /// Fetch a dependent object by key.
    async fn fetch(&self, key: &ObjectKey) -> StoreResult<Option<DependentObject>>;

    /// Create a dependent object; fails with `Conflict` if it already exists.
    async fn create(&self, object: &DependentObject) -> StoreResult<()>;

    /// Update a dependent object in place; fails with `Conflict` on a stale
    /// resource version.
    async fn update(&self, object: &DependentObject) -> StoreResult<()>;

    /// Delete a dependent object; absence is not an error.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;
}

/// Production store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    capabilities: Capabilities,
}

impl KubeStore {
    /// Create a store for `client`, limited to the negotiated capabilities.
    pub fn new(client: Client, capabilities: Capabilities) -> Self {
        Self {
            client,
            capabilities,
        }
    }

    fn guard(&self, kind: DependentKind) -> StoreResult<()> {
        let available = match kind {
            DependentKind::Route => self.capabilities.routes,
            DependentKind::ImageStream => self.capabilities.image_streams,
            _ => true,
        };
        if available {
            Ok(())
        } else {
            Err(StoreError::Unavailable(kind.as_str().to_string()))
        }
    }

    async fn fetch_typed<K>(&self, namespace: &str, name: &str) -> StoreResult<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(StoreError::from)
    }

    async fn create_typed<K>(&self, kind: DependentKind, object: &K) -> StoreResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let namespace = object.meta().namespace.clone().unwrap_or_default();
        let name = object.meta().name.clone().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), object).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => Err(StoreError::Conflict {
                kind: kind.as_str().to_string(),
                name,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_typed<K>(&self, kind: DependentKind, object: &K) -> StoreResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let namespace = object.meta().namespace.clone().unwrap_or_default();
        let name = object.meta().name.clone().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        match api.replace(&name, &PostParams::default(), object).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => Err(StoreError::Conflict {
                kind: kind.as_str().to_string(),
                name,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_typed<K>(&self, namespace: &str, name: &str) -> StoreResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list_declarations(&self, namespace: &str) -> StoreResult<Vec<InsightService>> {
        let api: Api<InsightService> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn update_declaration(&self, declaration: &InsightService) -> StoreResult<()> {
        let namespace = declaration.metadata.namespace.clone().unwrap_or_default();
        let name = declaration.metadata.name.clone().unwrap_or_default();
        let api: Api<InsightService> = Api::namespaced(self.client.clone(), &namespace);
        match api
            .replace(&name, &PostParams::default(), declaration)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => Err(StoreError::Conflict {
                kind: "InsightService".to_string(),
                name,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_declaration_status(
        &self,
        namespace: &str,
        name: &str,
        status: &InsightServiceStatus,
    ) -> StoreResult<()> {
        let api: Api<InsightService> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_infra(&self, namespace: &str, name: &str) -> StoreResult<Option<InsightInfra>> {
        self.fetch_typed(namespace, name).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>> {
        self.fetch_typed(namespace, name).await
    }

    async fn fetch(&self, key: &ObjectKey) -> StoreResult<Option<DependentObject>> {
        self.guard(key.kind)?;
        let found = match key.kind {
            DependentKind::Deployment => self
                .fetch_typed::<Deployment>(&key.namespace, &key.name)
                .await?
                .map(DependentObject::Deployment),
            DependentKind::Service => self
                .fetch_typed::<Service>(&key.namespace, &key.name)
                .await?
                .map(DependentObject::Service),
            DependentKind::ConfigMap => self
                .fetch_typed::<ConfigMap>(&key.namespace, &key.name)
                .await?
                .map(DependentObject::ConfigMap),
            DependentKind::Route => self
                .fetch_typed::<Route>(&key.namespace, &key.name)
                .await?
                .map(DependentObject::Route),
            DependentKind::ImageStream => self
                .fetch_typed::<ImageStream>(&key.namespace, &key.name)
                .await?
                .map(DependentObject::ImageStream),
        };
        Ok(found)
    }

    async fn create(&self, object: &DependentObject) -> StoreResult<()> {
        self.guard(object.kind())?;
        match object {
            DependentObject::Deployment(o) => self.create_typed(DependentKind::Deployment, o).await,
            DependentObject::Service(o) => self.create_typed(DependentKind::Service, o).await,
            DependentObject::ConfigMap(o) => self.create_typed(DependentKind::ConfigMap, o).await,
            DependentObject::Route(o) => self.create_typed(DependentKind::Route, o).await,
            DependentObject::ImageStream(o) => {
                self.create_typed(DependentKind::ImageStream, o).await
            }
        }
    }

    async fn update(&self, object: &DependentObject) -> StoreResult<()> {
        self.guard(object.kind())?;
        match object {
            DependentObject::Deployment(o) => self.update_typed(DependentKind::Deployment, o).await,
            DependentObject::Service(o) => self.update_typed(DependentKind::Service, o).await,
            DependentObject::ConfigMap(o) => self.update_typed(DependentKind::ConfigMap, o).await,
            DependentObject::Route(o) => self.update_typed(DependentKind::Route, o).await,
            DependentObject::ImageStream(o) => {
                self.update_typed(DependentKind::ImageStream, o).await
            }
        }
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.guard(key.kind)?;
        match key.kind {
            DependentKind::Deployment => {
                self.delete_typed::<Deployment>(&key.namespace, &key.name).await
            }
            DependentKind::Service => self.delete_typed::<Service>(&key.namespace, &key.name).await,
            DependentKind::ConfigMap => {
                self.delete_typed::<ConfigMap>(&key.namespace, &key.name).await
            }
            DependentKind::Route => self.delete_typed::<Route>(&key.namespace, &key.name).await,
            DependentKind::ImageStream => {
                self.delete_typed::<ImageStream>(&key.namespace, &key.name).await
            }
        }
    }
}
