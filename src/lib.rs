// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The control and data plane of an rpc broker cluster.
//!
//! # Overview
//! `switchyard` resolves calls addressed by a (group, service, version) triple to a live,
//! load-balanced endpoint. Brokers form a cluster, learn which app instances expose which
//! services through events propagated across that cluster, and keep per-destination
//! pools of connected endpoints in sync with what they learn.
//!
//! # Addressing
//! A [ServiceLocator] names a service by group, service and version, and has a stable
//! 64-bit id. The [ServiceRegistry] maps every known locator to the
//! [routes](registry::ServiceRoute) that can serve it.
//!
//! # Events
//! Control-plane changes (service exposure, app lifecycle, configuration and cache
//! invalidation) travel as [envelopes](event::Envelope) on the [EventBus]: published to
//! local consumers, then carried to every peer broker. Delivery to peers is best-effort
//! and bounded in time; a peer that can't be reached never blocks the others.
//!
//! # Membership
//! A broker either runs [standalone](cluster::Standalone), or pulls its peers from a
//! [discovery](cluster::Discovery) source. Either way, membership changes are observed
//! through a [Subscription] whose first item is always the current view.
//!
//! # Routing
//! Before a call is routed, a [FilterChain] may rewrite its destination; the bundled
//! [CanaryFilter](filter::CanaryFilter) shifts a fixed share of calls to a canary
//! version. The [UpstreamManager] then selects an endpoint by weighted round-robin,
//! reconnecting failed endpoints in the background.
#![warn(rust_2018_idioms, missing_docs)]
#![doc(
    issue_tracker_base_url = "https://github.com/nytopop/switchyard/issues/",
    html_root_url = "https://docs.rs/switchyard/0.1.0",
    test(
        no_crate_inject,
        attr(
            deny(rust_2018_idioms, unused_imports, unused_mut),
            allow(unused_variables)
        )
    )
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(test)]
#[test]
fn test_html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}

#[macro_use]
mod macros;

mod collections;

pub mod broker;
pub mod cluster;
pub mod discovery;
pub mod event;
pub mod external;
pub mod filter;
pub mod health;
pub mod locator;
pub mod metrics;
pub mod registry;
pub mod upstream;

#[doc(inline)]
pub use broker::{Broker, BrokerNode};
#[doc(inline)]
pub use cluster::{BrokerInfo, ClusterChange, Membership, NodeId, Subscription};
#[doc(inline)]
pub use event::{Envelope, Event, EventBus};
#[doc(inline)]
pub use filter::{FilterChain, FilterContext};
#[doc(inline)]
pub use health::{HealthAggregator, HealthStatus};
#[doc(inline)]
pub use locator::ServiceLocator;
#[doc(inline)]
pub use registry::ServiceRegistry;
#[doc(inline)]
pub use upstream::UpstreamManager;

/// A re-export of [async_trait] for convenience.
///
/// [async_trait]: https://docs.rs/async-trait/latest/async_trait/attr.async_trait.html
#[doc(inline)]
pub use tonic::async_trait;
