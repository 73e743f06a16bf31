//! Custom Resource Definitions for the Insight operator.
//!
//! - [`InsightService`]: one managed analytics workload (the declaration
//!   this operator reconciles)
//! - [`InsightInfra`]: shared messaging/datastore infrastructure, read-only
//!   to this operator

mod infra;
mod service;

pub use infra::{
    DatastoreStatus, InsightInfra, InsightInfraSpec, InsightInfraStatus, MessagingStatus,
};
pub use service::{
    EnvVarSpec, InsightService, InsightServiceSpec, InsightServiceStatus, RuntimeKind,
    SecretKeyRef, ServicePhase, DEFAULT_INFRA_NAME,
};
