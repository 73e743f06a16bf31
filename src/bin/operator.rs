//! Insight Kubernetes Operator binary.
//!
//! Runs the InsightService controller against the current cluster. With
//! `--generate-crds` it prints the CRD manifests and exits.

use std::sync::Arc;

use insight_operator::capabilities::Capabilities;
use insight_operator::controller::{insight_service_definition, ServiceController};
use insight_operator::crd::{InsightInfra, InsightService};
use insight_operator::secret_watcher::CredentialRotationWatcher;
use insight_operator::store::KubeStore;
use insight_operator::watch;
use kube::{Client, CustomResourceExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("insight_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    tracing::info!("Starting Insight Kubernetes Operator");

    // Check for CRD generation mode
    if std::env::args().any(|arg| arg == "--generate-crds") {
        generate_crds()?;
        return Ok(());
    }

    // Connect to Kubernetes
    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    // Negotiate optional API groups once; the result is immutable for the
    // lifetime of the process.
    let capabilities = Capabilities::discover(client.clone()).await?;

    let store = Arc::new(KubeStore::new(client.clone(), capabilities));
    let controller = ServiceController::new(store, insight_service_definition(), capabilities);
    let rotation_watcher = CredentialRotationWatcher::new(client.clone());

    // Run the controller and the rotation watcher until either exits.
    tokio::select! {
        result = watch::run(client.clone(), controller, capabilities) => {
            tracing::error!("InsightService controller exited: {:?}", result);
            result?;
        }
        result = rotation_watcher.run() => {
            tracing::error!("Credential rotation watcher exited: {:?}", result);
            result?;
        }
    }

    Ok(())
}

/// Generate CRD YAML files.
fn generate_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&InsightService::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&InsightInfra::crd())?);
    Ok(())
}
