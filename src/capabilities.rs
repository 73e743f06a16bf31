//! API-group capability negotiation.
//!
//! Optional dependents (Route, ImageStream) live in API groups that may not
//! be installed. Availability is discovered exactly once at startup; the
//! resulting map is immutable and consulted by both the watch registry and
//! the desired-state builder, so the set of watched kinds and the set of
//! producible kinds can never disagree.

use kube::{Client, Discovery};

use crate::error::OperatorResult;

/// API group providing the Route kind.
pub const ROUTE_API_GROUP: &str = "route.openshift.io";

/// API group providing the ImageStream kind.
pub const IMAGE_API_GROUP: &str = "image.openshift.io";

/// Immutable availability map of the optional API groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `route.openshift.io` is served by this cluster.
    pub routes: bool,
    /// `image.openshift.io` is served by this cluster.
    pub image_streams: bool,
}

impl Capabilities {
    /// Every optional group present.
    pub const fn all() -> Self {
        Self {
            routes: true,
            image_streams: true,
        }
    }

    /// No optional group present.
    pub const fn none() -> Self {
        Self {
            routes: false,
            image_streams: false,
        }
    }

    /// Run API discovery once and record which optional groups are served.
    pub async fn discover(client: Client) -> OperatorResult<Self> {
        let discovery = Discovery::new(client).run().await.map_err(crate::error::StoreError::Kube)?;

        let caps = Self {
            routes: discovery.has_group(ROUTE_API_GROUP),
            image_streams: discovery.has_group(IMAGE_API_GROUP),
        };

        tracing::info!(
            routes = caps.routes,
            image_streams = caps.image_streams,
            "Negotiated optional API groups"
        );

        Ok(caps)
    }
}
