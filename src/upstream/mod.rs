// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Upstream clusters: per-destination pools of live endpoints.
//!
//! Every destination (an app, or a single locator) that has been routed to owns an
//! [UpstreamCluster], which selects endpoints by weighted round-robin. The
//! [UpstreamManager] keeps pools in sync with service exposure events, reconnects failed
//! endpoints, and reaps pools that drained.
pub mod manager;
pub mod pool;

pub use manager::{UpstreamConsumer, UpstreamManager};
pub use pool::{Phase, UpstreamCluster};

use crate::{locator::ServiceLocator, registry::EndpointId, registry::ServiceRoute};
use bytes::Bytes;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;

/// An error raised by an [Endpoint] or a [Connector].
#[derive(Clone, Debug, Error)]
pub enum EndpointError {
    /// The endpoint couldn't be connected to.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The endpoint is no longer alive.
    #[error("endpoint closed")]
    Closed,

    /// The request failed.
    #[error("request failed: {0}")]
    Failed(String),
}

/// A live, multiplexed connection to an app instance that carries requests.
#[crate::async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Returns the id of this endpoint.
    fn id(&self) -> &EndpointId;

    /// Returns false once the underlying connection is known to be dead.
    fn is_alive(&self) -> bool {
        true
    }

    /// Send a request and await the response. Payload encoding is opaque here.
    async fn request(&self, payload: Bytes) -> Result<Bytes, EndpointError>;
}

/// Establishes [Endpoint]s for routes.
#[crate::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to the endpoint behind `route`.
    async fn connect(&self, route: &ServiceRoute) -> Result<Arc<dyn Endpoint>, EndpointError>;
}

/// Names a pool of endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKey {
    /// Every instance of an app.
    App(Arc<str>),
    /// Every provider of a locator, by locator id.
    Service(u64),
}

impl DestinationKey {
    /// Returns the key for every instance of `app_name`.
    pub fn app(app_name: &str) -> Self {
        Self::App(app_name.into())
    }
}

impl From<&ServiceLocator> for DestinationKey {
    fn from(l: &ServiceLocator) -> Self {
        Self::Service(l.id())
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::App(name) => write!(f, "app:{}", name),
            Self::Service(id) => write!(f, "svc:{:016x}", id),
        }
    }
}

/// Returned when a destination has no live endpoint to select.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("no available endpoint for {0}")]
pub struct NoAvailableEndpoint(pub DestinationKey);

/// An error routing a call.
#[derive(Clone, Debug, Error)]
pub enum RouteError {
    /// Neither the (possibly rewritten) destination nor the original one had a live
    /// endpoint.
    #[error(transparent)]
    NoAvailableEndpoint(#[from] NoAvailableEndpoint),

    /// The selected endpoint failed the request.
    #[error("endpoint {0}: {1}")]
    Endpoint(EndpointId, EndpointError),

    /// The selected endpoint didn't respond in time.
    #[error("endpoint {0} timed out")]
    Timeout(EndpointId),
}

/// Exponential backoff for reconnect attempts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first attempt.
    ///
    /// Must be non-zero. Defaults to 100ms.
    pub base: Duration,

    /// Upper bound on any single delay.
    ///
    /// Must be at least `base`. Defaults to 10s.
    pub max: Duration,

    /// Attempts made before giving up. Defaults to 6.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Returns the default backoff.
    pub const fn new() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            max_attempts: 6,
        }
    }

    /// Returns the delay preceding attempt number `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        (self.base.checked_mul(factor))
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Tuning for [UpstreamManager].
#[derive(Copy, Clone, Debug)]
pub struct UpstreamConfig {
    /// How long a drained pool is kept before it may be reaped.
    ///
    /// Defaults to 30s.
    pub drain_grace: Duration,

    /// Upper bound on a single forwarded call.
    ///
    /// Must be non-zero. Defaults to 10s.
    pub call_timeout: Duration,

    /// Backoff for reconnecting failed endpoints.
    pub reconnect: Backoff,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamConfig {
    /// Returns the default configuration.
    pub const fn new() -> Self {
        Self {
            drain_grace: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            reconnect: Backoff::new(),
        }
    }

    pub(crate) fn validate(&self) {
        assert!(self.call_timeout > Duration::from_secs(0));
        assert!(self.reconnect.base > Duration::from_secs(0));
        assert!(self.reconnect.base <= self.reconnect.max);
    }
}
