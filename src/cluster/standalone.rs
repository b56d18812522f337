// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Single-broker membership.
use super::{
    view::{Subscription, ViewPublisher},
    BroadcastReport, BrokerInfo, Membership, NodeId, PeerError,
};
use crate::event::Envelope;
use std::sync::Arc;

/// Membership for a broker that runs alone.
///
/// The view only ever contains the local broker, subscriptions yield that view once and
/// then stay silent, and broadcasts resolve immediately (the bus has already delivered the
/// envelope locally by the time it asks for a broadcast).
pub struct Standalone {
    local: BrokerInfo,
    view: Arc<ViewPublisher>,
}

impl Standalone {
    /// Create a standalone membership for `local`.
    pub fn new(local: BrokerInfo) -> Self {
        let view = ViewPublisher::new(local.clone(), vec![]);
        Self { local, view }
    }
}

#[crate::async_trait]
impl Membership for Standalone {
    fn local_broker(&self) -> &BrokerInfo {
        &self.local
    }

    fn all(&self) -> Arc<[BrokerInfo]> {
        Arc::clone(self.view.current().members())
    }

    fn subscribe(&self) -> Subscription {
        self.view.subscribe()
    }

    async fn broadcast(&self, _: &Envelope) -> BroadcastReport {
        BroadcastReport::default()
    }

    async fn unicast(&self, node: &NodeId, _: &Envelope) -> Result<(), PeerError> {
        if node == self.local.node_id() {
            Ok(())
        } else {
            Err(PeerError::UnknownPeer(node.clone()))
        }
    }
}
