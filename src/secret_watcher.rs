//! Credential rotation detection.
//!
//! Watches Secrets owned by an InsightInfra object. When the provisioner
//! rotates credentials it rewrites those secrets; the workloads consuming
//! them need a fresh reconciliation pass to pick the change up. Rotation is
//! signalled by annotating every declaration in the affected namespace,
//! which the primary watch turns into reconcile triggers.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::watcher::{self, watcher, Config};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tracing::{error, info, warn};

use crate::crd::InsightService;
use crate::error::OperatorResult;

/// Annotation stamped on declarations when their credentials rotated.
pub const ROTATION_ANNOTATION: &str = "insight.dev/credentials-rotated";

/// Watches infrastructure-owned secrets and re-triggers declarations.
pub struct CredentialRotationWatcher {
    client: Client,
}

impl CredentialRotationWatcher {
    /// Create a new rotation watcher.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Watch secret events until the stream ends.
    pub async fn run(self) -> OperatorResult<()> {
        let secrets: Api<Secret> = Api::all(self.client.clone());
        let mut stream = watcher(secrets, Config::default()).default_backoff().boxed();

        info!("Credential rotation watcher started");

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(secret)) => {
                    self.handle_rotation(&secret).await;
                }
                Ok(watcher::Event::Delete(secret)) => {
                    if is_infra_owned(&secret) {
                        warn!(
                            secret = %secret.name_any(),
                            "Infrastructure credentials secret deleted, dependent workloads may fail"
                        );
                    }
                }
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitApply(_)) => {}
                Ok(watcher::Event::InitDone) => {
                    info!("Secret watch initialization complete");
                }
                Err(e) => {
                    error!(error = %e, "Secret watch error");
                }
            }
        }

        warn!("Secret watch stream ended");
        Ok(())
    }

    async fn handle_rotation(&self, secret: &Secret) {
        if !is_infra_owned(secret) {
            return;
        }
        let Some(namespace) = secret.namespace() else {
            return;
        };

        info!(
            secret = %secret.name_any(),
            namespace = %namespace,
            "Infrastructure credentials changed, re-triggering declarations"
        );

        if let Err(e) = self.trigger_namespace(&namespace).await {
            error!(
                namespace = %namespace,
                error = %e,
                "Failed to re-trigger declarations after rotation"
            );
        }
    }

    /// Stamp every declaration in the namespace so the controller watch
    /// redelivers their keys.
    async fn trigger_namespace(&self, namespace: &str) -> OperatorResult<()> {
        let services: Api<InsightService> = Api::namespaced(self.client.clone(), namespace);
        let declarations = services.list(&ListParams::default()).await.map_err(crate::error::StoreError::Kube)?;

        for declaration in declarations.items {
            let name = declaration.name_any();
            let patch = serde_json::json!({
                "metadata": {
                    "annotations": {
                        ROTATION_ANNOTATION: chrono::Utc::now().to_rfc3339(),
                    }
                }
            });
            services
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(crate::error::StoreError::Kube)?;
        }

        Ok(())
    }
}

fn is_infra_owned(secret: &Secret) -> bool {
    secret
        .owner_references()
        .iter()
        .any(|or| or.kind == "InsightInfra" && or.controller == Some(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn secret_with_owner(kind: &str, controller: bool) -> Secret {
        Secret {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("creds".to_string()),
                namespace: Some("team-a".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "insight.dev/v1alpha1".to_string(),
                    kind: kind.to_string(),
                    name: "insight-infra".to_string(),
                    uid: "uid-infra".to_string(),
                    controller: Some(controller),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn only_infra_controlled_secrets_match() {
        assert!(is_infra_owned(&secret_with_owner("InsightInfra", true)));
        assert!(!is_infra_owned(&secret_with_owner("InsightInfra", false)));
        assert!(!is_infra_owned(&secret_with_owner("Deployment", true)));
        assert!(!is_infra_owned(&Secret::default()));
    }
}
