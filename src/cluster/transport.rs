// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The default peer transport: `BrokerLink.Deliver` over tonic channels.
use super::{
    proto::{self, broker_link_client::BrokerLinkClient},
    BrokerInfo, NodeId, PeerError, PeerTransport,
};
use crate::event::Envelope;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;
use tonic::transport::{self, Channel, ClientTlsConfig};

/// Delivers envelopes to peers over lazily connected grpc channels, one per peer.
#[derive(Default)]
pub struct GrpcTransport {
    channels: DashMap<NodeId, Channel>,
    tls: Option<Arc<ClientTlsConfig>>,
}

impl GrpcTransport {
    /// Create a transport that connects over plaintext unless a peer's schema requires tls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `tls` for peers whose schema requires it.
    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(Arc::new(tls));
        self
    }

    /// Returns the number of cached channels.
    pub fn cached(&self) -> usize {
        self.channels.len()
    }

    fn channel(&self, peer: &BrokerInfo) -> Result<Channel, PeerError> {
        if let Some(ch) = self.channels.get(peer.node_id()) {
            return Ok(ch.clone());
        }

        let unreachable = |e: &dyn std::fmt::Display| {
            PeerError::Unreachable(peer.node_id().clone(), e.to_string())
        };

        let mut endpoint =
            transport::Endpoint::from_shared(peer.uri()).map_err(|e| unreachable(&e))?;

        if peer.is_secure() {
            let tls = self.tls.as_deref().cloned().unwrap_or_else(ClientTlsConfig::new);
            endpoint = endpoint.tls_config(tls).map_err(|e| unreachable(&e))?;
        }

        // NOTE: connect_lazy doesn't dial until the first request.
        let ch = endpoint.connect_lazy();
        debug!("opened channel to {} at {}", peer.node_id(), peer.uri());

        Ok(self.channels.entry(peer.node_id().clone()).or_insert(ch).clone())
    }
}

#[crate::async_trait]
impl PeerTransport for GrpcTransport {
    async fn send(&self, peer: &BrokerInfo, env: &Envelope) -> Result<(), PeerError> {
        let mut client = BrokerLinkClient::new(self.channel(peer)?);

        client
            .deliver(proto::Envelope::from(env))
            .await
            .map(drop)
            .map_err(|s| PeerError::Unreachable(peer.node_id().clone(), s.message().to_owned()))
    }

    fn forget(&self, peer: &NodeId) {
        self.channels.remove(peer);
    }
}
