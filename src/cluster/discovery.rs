// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Discovery-backed membership.
use super::{
    view::{ClusterChange, Subscription, ViewPublisher},
    BroadcastReport, BrokerInfo, Membership, MembershipConfig, NodeId, PeerError, PeerTransport,
};
use crate::event::Envelope;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{interval, timeout, MissedTickBehavior},
};

/// An error returned by a [Discovery] source.
#[derive(Clone, Debug, Error)]
#[error("discovery failed: {0}")]
pub struct DiscoveryError(pub String);

/// A source of candidate peer brokers, such as a service catalog or a static seed list.
#[crate::async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Fetch the current set of brokers. It may or may not include the local broker.
    async fn fetch(&self) -> Result<Vec<BrokerInfo>, DiscoveryError>;
}

/// A fixed list of brokers.
#[crate::async_trait]
impl Discovery for Vec<BrokerInfo> {
    async fn fetch(&self) -> Result<Vec<BrokerInfo>, DiscoveryError> {
        Ok(self.clone())
    }
}

#[crate::async_trait]
impl<D: Discovery + ?Sized> Discovery for Arc<D> {
    async fn fetch(&self) -> Result<Vec<BrokerInfo>, DiscoveryError> {
        (**self).fetch().await
    }
}

/// Membership that tracks peers reported by a [Discovery] source.
pub struct DiscoveryMembership<D, T> {
    cfg: MembershipConfig,
    local: BrokerInfo,
    discovery: D,
    transport: T,
    view: Arc<ViewPublisher>,
    strikes: DashMap<NodeId, usize>,
    refreshing: Mutex<()>,
}

impl<D: Discovery, T: PeerTransport> DiscoveryMembership<D, T> {
    /// Create a new membership. The view contains only `local` until the first
    /// [refresh](Self::refresh).
    ///
    /// # Panics
    /// Panics if `cfg` is invalid (see [MembershipConfig]).
    pub fn new(cfg: MembershipConfig, local: BrokerInfo, discovery: D, transport: T) -> Self {
        cfg.validate();

        Self {
            view: ViewPublisher::new(local.clone(), vec![]),
            cfg,
            local,
            discovery,
            transport,
            strikes: DashMap::new(),
            refreshing: Mutex::new(()),
        }
    }

    /// Pull candidates from discovery and apply them to the view.
    ///
    /// Resolves to the published change, or `None` if membership didn't change.
    pub async fn refresh(&self) -> Result<Option<ClusterChange>, DiscoveryError> {
        let _guard = self.refreshing.lock().await;
        let candidates = self.discovery.fetch().await?;

        // peers that are still listed get another chance at receiving broadcasts.
        for b in candidates.iter() {
            self.strikes.remove(b.node_id());
        }

        let change = match self.view.publish(candidates) {
            Some(change) => change,
            None => return Ok(None),
        };

        for b in change.left().iter() {
            self.strikes.remove(b.node_id());
            self.transport.forget(b.node_id());
        }

        info!(
            "membership changed: epoch={:x} members={} joined={:?} left={:?}",
            change.epoch(),
            change.members().len(),
            change.joined().iter().map(BrokerInfo::node_id).collect::<Vec<_>>(),
            change.left().iter().map(BrokerInfo::node_id).collect::<Vec<_>>(),
        );

        Ok(Some(change))
    }

    /// Refresh membership every `refresh_interval`, forever.
    pub async fn run(self: Arc<Self>) {
        let mut tick = interval(self.cfg.refresh_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if let Err(e) = self.refresh().await {
                warn!("membership refresh failed: {}", e);
            }
        }
    }

    /// Returns the number of consecutive failed sends to `node`.
    pub fn strikes(&self, node: &NodeId) -> usize {
        self.strikes.get(node).map(|s| *s).unwrap_or_default()
    }

    async fn send_bounded(&self, peer: &BrokerInfo, env: &Envelope) -> Result<(), PeerError> {
        let res = timeout(self.cfg.send_timeout, self.transport.send(peer, env))
            .await
            .unwrap_or_else(|_| Err(PeerError::Timeout(peer.node_id().clone())));

        match &res {
            Ok(()) => {
                self.strikes.remove(peer.node_id());
            }
            Err(e) => {
                *self.strikes.entry(peer.node_id().clone()).or_insert(0) += 1;
                warn!("send of {} failed: {}", env.id(), e);
            }
        }

        res
    }
}

#[crate::async_trait]
impl<D: Discovery, T: PeerTransport> Membership for DiscoveryMembership<D, T> {
    fn local_broker(&self) -> &BrokerInfo {
        &self.local
    }

    fn all(&self) -> Arc<[BrokerInfo]> {
        Arc::clone(self.view.current().members())
    }

    fn subscribe(&self) -> Subscription {
        self.view.subscribe()
    }

    async fn broadcast(&self, env: &Envelope) -> BroadcastReport {
        let view = self.view.current();
        let mut report = BroadcastReport::default();

        let sends = FuturesUnordered::new();
        for peer in view.peers() {
            if self.strikes(peer.node_id()) >= self.cfg.strike_threshold {
                report.skipped.push(peer.node_id().clone());
                continue;
            }

            report.attempted.push(peer.node_id().clone());
            sends.push(self.send_bounded(peer, env));
        }

        report.failed = sends
            .filter_map(|r| async move { r.err() })
            .collect()
            .await;

        debug!(
            "broadcast {}: attempted={} failed={} skipped={}",
            env.id(),
            report.attempted.len(),
            report.failed.len(),
            report.skipped.len(),
        );

        report
    }

    async fn unicast(&self, node: &NodeId, env: &Envelope) -> Result<(), PeerError> {
        if node == self.local.node_id() {
            return Ok(());
        }

        let view = self.view.current();
        let peer = (view.lookup(node)).ok_or_else(|| PeerError::UnknownPeer(node.clone()))?;

        self.send_bounded(peer, env).await
    }
}
