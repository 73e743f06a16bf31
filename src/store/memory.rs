//! In-memory [`ResourceStore`] used by the engine tests.
//!
//! Mimics the API server's optimistic-concurrency semantics: every write
//! bumps a numeric resource version, updates require the caller's copy to
//! match the stored version, and creates fail when the object exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use tokio::sync::Mutex;

use crate::crd::{InsightInfra, InsightService, InsightServiceStatus};
use crate::error::StoreError;

use super::{DependentObject, ObjectKey, ResourceStore, StoreResult};

#[derive(Default)]
struct Inner {
    declarations: HashMap<(String, String), InsightService>,
    infras: HashMap<(String, String), InsightInfra>,
    external_config_maps: HashMap<(String, String), ConfigMap>,
    dependents: HashMap<ObjectKey, DependentObject>,
}

/// In-memory store with API-server-like write semantics.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    dependent_writes: AtomicUsize,
    status_writes: AtomicUsize,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dependent-object writes (creates + updates + deletes) so far.
    pub fn dependent_writes(&self) -> usize {
        self.dependent_writes.load(Ordering::SeqCst)
    }

    /// Number of declaration status patches so far.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Seed a declaration, assigning a uid and resource version.
    pub async fn put_declaration(&self, mut declaration: InsightService) {
        let ns = declaration.metadata.namespace.clone().unwrap_or_default();
        let name = declaration.metadata.name.clone().unwrap_or_default();
        if declaration.metadata.uid.is_none() {
            declaration.metadata.uid = Some(format!("uid-{ns}-{name}"));
        }
        if declaration.metadata.resource_version.is_none() {
            declaration.metadata.resource_version = Some("1".into());
        }
        self.inner
            .lock()
            .await
            .declarations
            .insert((ns, name), declaration);
    }

    /// Seed an infrastructure object.
    pub async fn put_infra(&self, infra: InsightInfra) {
        let ns = infra.metadata.namespace.clone().unwrap_or_default();
        let name = infra.metadata.name.clone().unwrap_or_default();
        self.inner.lock().await.infras.insert((ns, name), infra);
    }

    /// Seed an externally owned ConfigMap (a properties bundle).
    pub async fn put_external_config_map(&self, cm: ConfigMap) {
        let ns = cm.metadata.namespace.clone().unwrap_or_default();
        let name = cm.metadata.name.clone().unwrap_or_default();
        self.inner
            .lock()
            .await
            .external_config_maps
            .insert((ns, name), cm);
    }

    /// Read back a declaration.
    pub async fn declaration(&self, namespace: &str, name: &str) -> Option<InsightService> {
        self.inner
            .lock()
            .await
            .declarations
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Read back a dependent object.
    pub async fn dependent(&self, key: &ObjectKey) -> Option<DependentObject> {
        self.inner.lock().await.dependents.get(key).cloned()
    }

    /// Overwrite a dependent object directly, bypassing version checks.
    /// Stands in for another actor editing the object out from under the
    /// engine.
    pub async fn tamper(&self, object: DependentObject) {
        self.inner.lock().await.dependents.insert(object.key(), object);
    }

    /// Dependent objects currently stored for a namespace.
    pub async fn dependents_in(&self, namespace: &str) -> Vec<DependentObject> {
        self.inner
            .lock()
            .await
            .dependents
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

fn bump_version(version: &mut Option<String>) {
    let next = version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    *version = Some(next.to_string());
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_declarations(&self, namespace: &str) -> StoreResult<Vec<InsightService>> {
        let inner = self.inner.lock().await;
        let mut found: Vec<InsightService> = inner
            .declarations
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, v)| v.clone())
            .collect();
        found.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(found)
    }

    async fn update_declaration(&self, declaration: &InsightService) -> StoreResult<()> {
        let ns = declaration.metadata.namespace.clone().unwrap_or_default();
        let name = declaration.metadata.name.clone().unwrap_or_default();
        let mut inner = self.inner.lock().await;
        let slot = inner
            .declarations
            .get_mut(&(ns, name.clone()))
            .ok_or_else(|| StoreError::Unavailable(format!("InsightService/{name}")))?;
        if slot.metadata.resource_version != declaration.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: "InsightService".into(),
                name,
            });
        }
        let mut updated = declaration.clone();
        bump_version(&mut updated.metadata.resource_version);
        *slot = updated;
        Ok(())
    }

    async fn patch_declaration_status(
        &self,
        namespace: &str,
        name: &str,
        status: &InsightServiceStatus,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let slot = inner
            .declarations
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::Unavailable(format!("InsightService/{name}")))?;
        slot.status = Some(status.clone());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_infra(&self, namespace: &str, name: &str) -> StoreResult<Option<InsightInfra>> {
        Ok(self
            .inner
            .lock()
            .await
            .infras
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>> {
        let inner = self.inner.lock().await;
        let key = (namespace.to_string(), name.to_string());
        if let Some(cm) = inner.external_config_maps.get(&key) {
            return Ok(Some(cm.clone()));
        }
        let owned = ObjectKey::new(super::DependentKind::ConfigMap, namespace, name);
        Ok(inner.dependents.get(&owned).and_then(|d| match d {
            DependentObject::ConfigMap(cm) => Some(cm.clone()),
            _ => None,
        }))
    }

    async fn fetch(&self, key: &ObjectKey) -> StoreResult<Option<DependentObject>> {
        Ok(self.inner.lock().await.dependents.get(key).cloned())
    }

    async fn create(&self, object: &DependentObject) -> StoreResult<()> {
        let key = object.key();
        let mut inner = self.inner.lock().await;
        if inner.dependents.contains_key(&key) {
            return Err(StoreError::Conflict {
                kind: key.kind.as_str().to_string(),
                name: key.name,
            });
        }
        let mut stored = object.clone();
        stored.meta_mut().resource_version = Some("1".into());
        inner.dependents.insert(key, stored);
        self.dependent_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, object: &DependentObject) -> StoreResult<()> {
        let key = object.key();
        let mut inner = self.inner.lock().await;
        let slot = inner
            .dependents
            .get_mut(&key)
            .ok_or_else(|| StoreError::Unavailable(key.to_string()))?;
        if slot.meta().resource_version != object.meta().resource_version {
            return Err(StoreError::Conflict {
                kind: key.kind.as_str().to_string(),
                name: key.name,
            });
        }
        let mut updated = object.clone();
        bump_version(&mut updated.meta_mut().resource_version);
        *slot = updated;
        self.dependent_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.dependents.remove(key).is_some() {
            self.dependent_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
