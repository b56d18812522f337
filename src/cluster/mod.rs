// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Broker cluster membership.
//!
//! A [Membership] knows which brokers make up the cluster, lets interested tasks observe
//! changes through a [Subscription], and carries envelopes to peers. Two variants exist:
//!
//! * [Standalone]: a single fixed broker. Nothing ever changes and broadcasts are no-ops.
//! * [DiscoveryMembership]: peers are periodically pulled from a [Discovery] source and
//!   diffed against the previous view; envelopes travel over a [PeerTransport].
pub mod discovery;
pub mod proto;
pub mod standalone;
pub mod transport;
pub mod view;

pub use discovery::{Discovery, DiscoveryError, DiscoveryMembership};
pub use standalone::Standalone;
pub use transport::GrpcTransport;
pub use view::{ClusterChange, MembershipEvent, Subscription};

use crate::event::Envelope;
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

/// The id of a broker node. Unique within a cluster.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

/// The identity of a broker in the cluster. Equality, ordering and hashing only consider
/// the [NodeId].
#[derive(Clone, Debug)]
pub struct BrokerInfo {
    node_id: NodeId,
    schema: Arc<str>,
    ip: IpAddr,
    rpc_port: u16,
    web_port: u16,
}

impl PartialEq for BrokerInfo {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

derive_cmp_with!(BrokerInfo, b => &b.node_id);

impl BrokerInfo {
    /// Create a new broker identity using the `http` schema and no web port.
    pub fn new<N: Into<NodeId>>(node_id: N, ip: IpAddr, rpc_port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            schema: "http".into(),
            ip,
            rpc_port,
            web_port: 0,
        }
    }

    /// Set the transport schema (`http`, `https`, `tcp`, ...).
    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the auxiliary (web) port.
    pub fn web_port(mut self, port: u16) -> Self {
        self.web_port = port;
        self
    }

    /// Returns the node id.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Returns the transport schema.
    pub fn transport_schema(&self) -> &str {
        &self.schema
    }

    /// Returns the broker's ip address.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Returns the rpc port.
    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    /// Returns the auxiliary (web) port, or 0 if there isn't one.
    pub fn aux_port(&self) -> u16 {
        self.web_port
    }

    /// Returns the socket address of the rpc listener.
    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.rpc_port)
    }

    /// Returns true if the broker expects tls on its rpc port.
    pub fn is_secure(&self) -> bool {
        matches!(&*self.schema, "https" | "tls" | "tcps")
    }

    /// Returns the uri used to reach the broker-to-broker channel.
    pub fn uri(&self) -> String {
        let scheme = if self.is_secure() { "https" } else { "http" };
        format!("{}://{}", scheme, self.rpc_addr())
    }
}

/// An error sending an envelope to a single peer.
#[derive(Clone, Debug, Error)]
pub enum PeerError {
    /// The peer could not be connected to, or rejected the envelope.
    #[error("peer {0} is unreachable: {1}")]
    Unreachable(NodeId, String),

    /// The send didn't complete within the configured timeout.
    #[error("send to peer {0} timed out")]
    Timeout(NodeId),

    /// The peer isn't in the current view.
    #[error("peer {0} is not a cluster member")]
    UnknownPeer(NodeId),
}

impl PeerError {
    /// Returns the peer this error refers to.
    pub fn node_id(&self) -> &NodeId {
        match self {
            Self::Unreachable(n, _) | Self::Timeout(n) | Self::UnknownPeer(n) => n,
        }
    }
}

/// The outcome of a best-effort broadcast. A broadcast never fails as a whole; peers that
/// couldn't be reached are listed in [failed][Self::failed].
#[derive(Clone, Debug, Default)]
pub struct BroadcastReport {
    /// Peers a send was attempted to.
    pub attempted: Vec<NodeId>,
    /// Peers (a subset of `attempted`) whose send failed, and why.
    pub failed: Vec<PeerError>,
    /// Peers that were not attempted because they exceeded the failure threshold.
    pub skipped: Vec<NodeId>,
}

impl BroadcastReport {
    /// Returns the number of peers that acknowledged the envelope.
    pub fn delivered(&self) -> usize {
        self.attempted.len() - self.failed.len()
    }

    /// Returns true if every known peer acknowledged the envelope.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Tuning for [DiscoveryMembership].
#[derive(Copy, Clone, Debug)]
pub struct MembershipConfig {
    /// How often to pull candidates from discovery.
    ///
    /// Defaults to 5s.
    pub refresh_interval: Duration,

    /// Upper bound on a single peer send.
    ///
    /// Defaults to 3s.
    pub send_timeout: Duration,

    /// Number of consecutive failed sends after which a peer is skipped by broadcasts until
    /// the next refresh.
    ///
    /// Must be non-zero. Defaults to 3.
    pub strike_threshold: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipConfig {
    /// Returns the default configuration.
    pub const fn new() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            send_timeout: Duration::from_secs(3),
            strike_threshold: 3,
        }
    }

    /// Returns a configuration with short intervals, suitable for tests and local clusters.
    pub const fn low_latency() -> Self {
        Self {
            refresh_interval: Duration::from_millis(200),
            send_timeout: Duration::from_millis(250),
            strike_threshold: 3,
        }
    }

    pub(crate) fn validate(&self) {
        assert_ne!(0, self.strike_threshold);
        assert!(self.refresh_interval > Duration::from_secs(0));
        assert!(self.send_timeout > Duration::from_secs(0));
    }
}

/// Carries envelopes to a single peer broker.
#[crate::async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Deliver `env` to `peer`, resolving once the peer has acknowledged it.
    async fn send(&self, peer: &BrokerInfo, env: &Envelope) -> Result<(), PeerError>;

    /// Drop any cached connection state for a peer that left the cluster.
    fn forget(&self, _peer: &NodeId) {}
}

/// Cluster membership and the broadcast/unicast primitives built on it.
#[crate::async_trait]
pub trait Membership: Send + Sync + 'static {
    /// Returns the local broker. Always a member of [all][Self::all].
    fn local_broker(&self) -> &BrokerInfo;

    /// Returns every known broker, sorted by node id, including the local one.
    fn all(&self) -> Arc<[BrokerInfo]>;

    /// Subscribe to membership changes. The first item received is always the current
    /// view; any following items are changes.
    fn subscribe(&self) -> Subscription;

    /// Send `env` to every known peer. Never fails as a whole, and never hangs: each peer
    /// send is individually bounded.
    async fn broadcast(&self, env: &Envelope) -> BroadcastReport;

    /// Send `env` to exactly one peer.
    async fn unicast(&self, node: &NodeId, env: &Envelope) -> Result<(), PeerError>;

    /// Returns the number of peers (excluding the local broker).
    fn peer_count(&self) -> usize {
        self.all().len().saturating_sub(1)
    }
}
