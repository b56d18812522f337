// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Aggregated health checks.
use crate::{
    cluster::{proto, NodeId},
    locator::ServiceLocator,
    registry::{EndpointId, ServiceRegistry, ServiceRoute},
    upstream::{DestinationKey, Endpoint, EndpointError, UpstreamManager},
};
use bytes::Bytes;
use futures::future::join_all;
use log::debug;
use prost::Message;
use std::{collections::HashMap, sync::Arc};

/// The service name the aggregator is exposed under.
pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

/// The result of a health check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum HealthStatus {
    /// Nothing is known: no indicator applies.
    Unknown = 0,
    /// Every applicable indicator is healthy.
    Serving = 1,
    /// At least one applicable indicator is unhealthy.
    Down = -1,
}

impl HealthStatus {
    /// Returns the wire code of this status.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Returns the status with wire code `code`. Unrecognized codes are [Down](Self::Down).
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Unknown,
            1 => Self::Serving,
            _ => Self::Down,
        }
    }
}

impl From<HealthStatus> for proto::HealthCheckResponse {
    fn from(s: HealthStatus) -> Self {
        Self::with_status(s.code())
    }
}

impl From<&proto::HealthCheckResponse> for HealthStatus {
    fn from(r: &proto::HealthCheckResponse) -> Self {
        Self::from_code(r.status)
    }
}

/// Reports whether one facet of the broker (or a service it hosts) is healthy.
#[crate::async_trait]
pub trait HealthIndicator: Send + Sync + 'static {
    /// Returns a short name for logs.
    fn name(&self) -> &str;

    /// Returns true if healthy.
    async fn is_healthy(&self) -> bool;
}

/// Combines [HealthIndicator]s into a single [HealthStatus] per service.
///
/// Global indicators apply to every check; scoped ones only to checks for the service
/// they were registered under.
#[derive(Default)]
pub struct HealthAggregator {
    global: Vec<Arc<dyn HealthIndicator>>,
    scoped: HashMap<String, Vec<Arc<dyn HealthIndicator>>>,
}

impl HealthAggregator {
    /// Create an aggregator with no indicators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an indicator that applies to every check.
    pub fn with_indicator<I: HealthIndicator>(mut self, indicator: I) -> Self {
        self.global.push(Arc::new(indicator));
        self
    }

    /// Add an indicator that only applies to checks for `service`.
    pub fn with_service_indicator<I: HealthIndicator>(mut self, service: &str, indicator: I) -> Self {
        (self.scoped.entry(service.to_owned()).or_default()).push(Arc::new(indicator));
        self
    }

    /// Check the health of `service`. An empty name only runs global indicators.
    pub async fn check(&self, service: &str) -> HealthStatus {
        let scoped = self.scoped.get(service).into_iter().flatten();
        let applicable: Vec<_> = self.global.iter().chain(scoped).collect();
        if applicable.is_empty() {
            return HealthStatus::Unknown;
        }

        let results = join_all(applicable.iter().map(|i| i.is_healthy())).await;
        let mut status = HealthStatus::Serving;
        for (i, healthy) in applicable.iter().zip(results) {
            if !healthy {
                debug!("{} is unhealthy (checking {:?})", i.name(), service);
                status = HealthStatus::Down;
            }
        }
        status
    }

    /// Serve this aggregator as the resident service [HEALTH_SERVICE] of the broker
    /// `node`, so it can be reached through ordinary routing. Returns the locator it was
    /// registered under.
    pub fn expose(
        self: &Arc<Self>,
        registry: &ServiceRegistry,
        manager: &UpstreamManager,
        node: &NodeId,
    ) -> ServiceLocator {
        let locator = ServiceLocator::new("", HEALTH_SERVICE, "");
        let id = EndpointId::from(format!("{}@{}", HEALTH_SERVICE, node));

        let route = ServiceRoute::new(id.clone(), id.as_str(), node.clone()).app_name(HEALTH_SERVICE);
        registry.register_local(&locator, route);

        let endpoint = Arc::new(HealthEndpoint {
            id,
            aggregator: Arc::clone(self),
        });
        manager.on_endpoint_added(DestinationKey::from(&locator), endpoint, 1);

        locator
    }
}

/// A resident endpoint answering encoded [HealthCheckRequest](proto::HealthCheckRequest)s.
struct HealthEndpoint {
    id: EndpointId,
    aggregator: Arc<HealthAggregator>,
}

#[crate::async_trait]
impl Endpoint for HealthEndpoint {
    fn id(&self) -> &EndpointId {
        &self.id
    }

    async fn request(&self, payload: Bytes) -> Result<Bytes, EndpointError> {
        let req = proto::HealthCheckRequest::decode(payload)
            .map_err(|e| EndpointError::Failed(e.to_string()))?;

        let status = self.aggregator.check(&req.service).await;
        let resp = proto::HealthCheckResponse::from(status);
        Ok(resp.encode_to_vec().into())
    }
}
