//! Reconciliation engine for InsightService declarations.
//!
//! - [`ServiceController`]: the framework-facing entry point, one
//!   `(namespace, name)` key per invocation
//! - [`deployer::SingletonServiceDeployer`]: one fetch/build/diff/apply pass
//! - [`requeue`]: the pure re-trigger decision
//!
//! # Usage with kube-runtime
//!
//! The hosting dispatcher owns the event loop; the engine only exposes
//! `reconcile`:
//!
//! ```ignore
//! use insight_operator::controller::{ReconcileOutcome, ServiceController};
//!
//! Controller::new(services, watcher_config)
//!     .run(|service, ctx| async move {
//!         let (namespace, name) = key_of(&service)?;
//!         match ctx.reconcile(&namespace, &name).await? {
//!             ReconcileOutcome::Settled => Ok(Action::await_change()),
//!             ReconcileOutcome::RequeueAfter(delay) => Ok(Action::requeue(delay)),
//!         }
//!     }, error_policy, controller)
//!     .for_each(|_| futures::future::ready(()))
//!     .await;
//! ```

pub mod deployer;
pub mod requeue;
mod service;

pub use service::{insight_service_definition, ServiceController};

use std::time::Duration;

/// Result of one reconciliation pass.
///
/// A failed pass is expressed as the `Err` branch of the surrounding
/// `Result`, so a pass can never both fail and request a requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged; nothing scheduled until the next external event.
    Settled,
    /// Run again after the given delay.
    RequeueAfter(Duration),
}

/// Health-check convention of a workload runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthProbeStyle {
    /// Quarkus-style health endpoints.
    Quarkus,
    /// Spring Boot actuator endpoints.
    SpringBoot,
}

impl HealthProbeStyle {
    /// Liveness endpoint path.
    pub fn liveness_path(&self) -> &'static str {
        match self {
            HealthProbeStyle::Quarkus => "/q/health/live",
            HealthProbeStyle::SpringBoot => "/actuator/health/liveness",
        }
    }

    /// Readiness endpoint path.
    pub fn readiness_path(&self) -> &'static str {
        match self {
            HealthProbeStyle::Quarkus => "/q/health/ready",
            HealthProbeStyle::SpringBoot => "/actuator/health/readiness",
        }
    }
}

/// Per-workload-type configuration of the deployer.
///
/// Declares which dependent kinds this workload requires beyond the core
/// set: its messaging topics, whether messaging/persistence are mandatory,
/// the health-check convention, and (optionally) the env var under which its
/// endpoint is propagated to sibling declarations.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    /// Image used when the declaration does not name one.
    pub default_image: String,
    /// Topics the workload type always consumes.
    pub message_topics: Vec<String>,
    /// Messaging infrastructure must be provisioned before the workload can
    /// settle.
    pub requires_messaging: bool,
    /// Datastore infrastructure must be provisioned before the workload can
    /// settle.
    pub requires_persistence: bool,
    /// Health-check convention for the workload's probes.
    pub health_probe: HealthProbeStyle,
    /// Env var under which the workload's endpoint is injected into sibling
    /// declarations; `None` disables propagation.
    pub endpoint_env_var: Option<String>,
}
