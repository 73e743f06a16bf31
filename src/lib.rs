//! Insight Kubernetes Operator
//!
//! This crate provides a Kubernetes operator that deploys and supervises
//! Insight decision-analytics workloads declared through the
//! [`InsightService`] custom resource.
//!
//! # Custom Resource Definitions
//!
//! - **InsightService**: one managed workload; the operator converges a
//!   Deployment, Service, properties ConfigMap and, where the cluster
//!   supports the API groups, a Route and an ImageStream to it
//! - **InsightInfra**: the shared messaging/datastore infrastructure a
//!   workload binds to; read-only for this operator
//!
//! # Example
//!
//! ```yaml
//! apiVersion: insight.dev/v1alpha1
//! kind: InsightService
//! metadata:
//!   name: audit
//! spec:
//!   image: registry/app:1.0
//!   runtime: Quarkus
//!   env:
//!     - name: MODE
//!       value: audit
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capabilities;
pub mod controller;
pub mod crd;
pub mod error;
pub mod ext;
pub mod resources;
pub mod secret_watcher;
pub mod store;
pub mod watch;

pub use capabilities::Capabilities;
pub use crd::{InsightInfra, InsightService, InsightServiceSpec};
pub use error::{OperatorError, OperatorResult, StoreError};
