// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Read-only broker metrics.
//!
//! Exporting is left to whatever scrapes [Metrics::scrape]; the text it produces follows
//! the prometheus exposition format.
use log::warn;
use prometheus::{core::Collector, Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::convert::TryFrom;

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric names are valid")
}

fn widen(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Counters and gauges shared by the broker's components.
///
/// Each broker owns its own registry, so any number of them can live in one process.
pub struct Metrics {
    registry: Registry,
    peers: IntGauge,
    published: IntCounter,
    consumer_failures: IntCounter,
    peer_failures: IntCounter,
    no_endpoint: IntCounter,
    reconnects: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a zeroed set of metrics.
    pub fn new() -> Self {
        let m = Self {
            registry: Registry::new(),
            peers: (IntGauge::new("switchyard_cluster_peers", "Number of peer brokers."))
                .expect("metric names are valid"),
            published: counter(
                "switchyard_events_published_total",
                "Envelopes published to local consumers.",
            ),
            consumer_failures: counter(
                "switchyard_consumer_failures_total",
                "Envelopes a consumer failed to handle.",
            ),
            peer_failures: counter(
                "switchyard_peer_send_failures_total",
                "Failed sends to peer brokers.",
            ),
            no_endpoint: counter(
                "switchyard_no_available_endpoint_total",
                "Selections that found no live endpoint.",
            ),
            reconnects: counter(
                "switchyard_reconnect_attempts_total",
                "Endpoint reconnect attempts.",
            ),
        };

        let all: [Box<dyn Collector>; 6] = [
            Box::new(m.peers.clone()),
            Box::new(m.published.clone()),
            Box::new(m.consumer_failures.clone()),
            Box::new(m.peer_failures.clone()),
            Box::new(m.no_endpoint.clone()),
            Box::new(m.reconnects.clone()),
        ];
        for c in IntoIterator::into_iter(all) {
            m.registry.register(c).expect("metric names are unique");
        }

        m
    }

    pub(crate) fn set_peers(&self, n: usize) {
        self.peers.set(i64::try_from(n).unwrap_or(i64::MAX));
    }

    pub(crate) fn published(&self) {
        self.published.inc();
    }

    pub(crate) fn consumer_failed(&self) {
        self.consumer_failures.inc();
    }

    pub(crate) fn peer_failed(&self, n: usize) {
        self.peer_failures.inc_by(widen(n));
    }

    pub(crate) fn no_endpoint(&self) {
        self.no_endpoint.inc();
    }

    pub(crate) fn reconnect_attempted(&self) {
        self.reconnects.inc();
    }

    /// Returns the current number of peer brokers.
    pub fn peers(&self) -> u64 {
        u64::try_from(self.peers.get()).unwrap_or(0)
    }

    /// Returns the number of consumer failures so far.
    pub fn consumer_failures(&self) -> u64 {
        self.consumer_failures.get()
    }

    /// Returns the number of failed peer sends so far.
    pub fn peer_failures(&self) -> u64 {
        self.peer_failures.get()
    }

    /// Returns the number of selections that found no endpoint.
    pub fn no_endpoint_failures(&self) -> u64 {
        self.no_endpoint.get()
    }

    /// Returns the registry every metric is registered with, for merging into another
    /// exporter.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric as text.
    pub fn scrape(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            warn!("failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}
