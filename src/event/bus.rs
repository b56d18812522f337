// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Local dispatch and cluster-wide distribution of envelopes.
use super::{DecodeError, Envelope, Event};
use crate::{
    cluster::{BroadcastReport, Membership, NodeId, PeerError},
    metrics::Metrics,
};
use arc_swap::ArcSwap;
use log::{debug, warn};
use std::{
    borrow::Cow,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex, PoisonError,
    },
};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// An error returned by a consumer that failed to handle an envelope.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The payload of a well-known event was malformed.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The consumer (or a collaborator it forwards to) failed.
    #[error("{0}")]
    Failed(String),
}

impl ConsumerError {
    /// Create a [ConsumerError::Failed] from anything printable.
    pub fn failed<E: fmt::Display>(e: E) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Something that handles envelopes delivered by an [EventBus].
#[crate::async_trait]
pub trait EventConsumer: Send + Sync + 'static {
    /// Returns true if envelopes of type `ty` should be handed to this consumer.
    fn accepts(&self, ty: &str) -> bool;

    /// Handle a single envelope.
    ///
    /// A failure is logged and counted by the bus, and never prevents other consumers from
    /// receiving the same envelope.
    async fn handle(&self, env: &Envelope) -> Result<(), ConsumerError>;
}

#[crate::async_trait]
impl<C: EventConsumer + ?Sized> EventConsumer for Arc<C> {
    fn accepts(&self, ty: &str) -> bool {
        (**self).accepts(ty)
    }

    async fn handle(&self, env: &Envelope) -> Result<(), ConsumerError> {
        (**self).handle(env).await
    }
}

/// A predicate over envelope types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeMatcher {
    /// Matches every type.
    Any,
    /// Matches exactly one type.
    Exact(Cow<'static, str>),
    /// Matches every type starting with a prefix, such as `io.switchyard.service.`.
    Prefix(Cow<'static, str>),
    /// Matches any of a set of exact types.
    OneOf(&'static [&'static str]),
}

impl TypeMatcher {
    /// Returns true if `ty` matches.
    pub fn matches(&self, ty: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(t) => ty == &**t,
            Self::Prefix(p) => ty.starts_with(&**p),
            Self::OneOf(ts) => ts.contains(&ty),
        }
    }
}

/// An [EventConsumer] made from a matcher and a synchronous closure.
pub struct FnConsumer<F> {
    matcher: TypeMatcher,
    f: F,
}

impl<F> FnConsumer<F>
where F: Fn(&Envelope) -> Result<(), ConsumerError> + Send + Sync + 'static
{
    /// Create a consumer calling `f` for every envelope `matcher` accepts.
    pub fn new(matcher: TypeMatcher, f: F) -> Self {
        Self { matcher, f }
    }
}

#[crate::async_trait]
impl<F> EventConsumer for FnConsumer<F>
where F: Fn(&Envelope) -> Result<(), ConsumerError> + Send + Sync + 'static
{
    fn accepts(&self, ty: &str) -> bool {
        self.matcher.matches(ty)
    }

    async fn handle(&self, env: &Envelope) -> Result<(), ConsumerError> {
        (self.f)(env)
    }
}

/// How envelopes are delivered to a consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Awaited by the publisher, one consumer after another, in registration order.
    Inline,
    /// Queued to a dedicated worker task. The publisher doesn't wait for the consumer, and
    /// the consumer sees envelopes in publish order.
    ///
    /// Subscribing with this policy must happen within a tokio runtime.
    Queued,
}

/// Identifies a subscription on an [EventBus].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum Delivery {
    Inline,
    Queued(UnboundedSender<Envelope>),
}

struct Subscriber {
    id: SubscriberId,
    consumer: Arc<dyn EventConsumer>,
    delivery: Delivery,
}

/// Dispatches envelopes to local consumers, and to peer brokers through [Membership].
///
/// Locally originated envelopes enter through [broadcast](Self::broadcast) (or
/// [publish](Self::publish) if they shouldn't leave this broker); envelopes that arrived
/// from a peer enter through [receive_from_peer](Self::receive_from_peer), which never
/// forwards them again.
pub struct EventBus {
    membership: Arc<dyn Membership>,
    metrics: Arc<Metrics>,
    subs: ArcSwap<Vec<Arc<Subscriber>>>,
    writer: Mutex<()>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus distributing envelopes through `membership`.
    pub fn new(membership: Arc<dyn Membership>, metrics: Arc<Metrics>) -> Self {
        Self {
            membership,
            metrics,
            subs: ArcSwap::default(),
            writer: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the membership envelopes are distributed through.
    pub fn membership(&self) -> &Arc<dyn Membership> {
        &self.membership
    }

    /// Returns the node id of the local broker, which is the source of emitted events.
    pub fn local_node(&self) -> &NodeId {
        self.membership.local_broker().node_id()
    }

    /// Register a consumer. Consumers receive envelopes in registration order.
    pub fn subscribe<C: EventConsumer>(&self, consumer: C, policy: DeliveryPolicy) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Relaxed));
        let consumer: Arc<dyn EventConsumer> = Arc::new(consumer);

        let delivery = match policy {
            DeliveryPolicy::Inline => Delivery::Inline,
            DeliveryPolicy::Queued => {
                let (tx, rx) = unbounded_channel();
                let worker = drain(id, Arc::clone(&consumer), rx, Arc::clone(&self.metrics));
                tokio::spawn(worker);
                Delivery::Queued(tx)
            }
        };

        let sub = Arc::new(Subscriber { id, consumer, delivery });

        let _w = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut subs = Vec::clone(&self.subs.load());
        subs.push(sub);
        self.subs.store(Arc::new(subs));

        debug!("subscribed consumer {} ({:?})", id, policy);
        id
    }

    /// Remove a consumer. Queued envelopes already handed to its worker are still
    /// delivered. Returns false if `id` wasn't subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let _w = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut subs = Vec::clone(&self.subs.load());

        let before = subs.len();
        subs.retain(|s| s.id != id);
        if before == subs.len() {
            return false;
        }

        self.subs.store(Arc::new(subs));
        debug!("unsubscribed consumer {}", id);
        true
    }

    /// Returns the number of registered consumers.
    pub fn subscribers(&self) -> usize {
        self.subs.load().len()
    }

    /// Deliver `env` to every local consumer that accepts its type. Never leaves this
    /// broker.
    ///
    /// Resolves to the number of consumers the envelope was handed to (including any that
    /// subsequently failed). An envelope no consumer accepts is silently dropped.
    pub async fn publish(&self, env: &Envelope) -> usize {
        let subs = self.subs.load_full();
        let mut handed = 0;

        for sub in subs.iter().filter(|s| s.consumer.accepts(env.ty())) {
            handed += 1;

            match &sub.delivery {
                Delivery::Inline => {
                    deliver(sub.id, &*sub.consumer, env, &self.metrics).await;
                }

                Delivery::Queued(tx) => {
                    if tx.send(env.clone()).is_err() {
                        warn!("consumer {} worker is gone; dropped {}", sub.id, env.id());
                        self.metrics.consumer_failed();
                    }
                }
            }
        }

        if handed == 0 && !Event::is_known(env.ty()) {
            debug!("no consumer for {} ({})", env.id(), env.ty());
        }

        self.metrics.published();
        handed
    }

    /// Publish `env` locally, then send it to every peer broker.
    ///
    /// Resolves once delivery to every peer has been attempted; peer failures are reported,
    /// never raised.
    pub async fn broadcast(&self, env: &Envelope) -> BroadcastReport {
        self.publish(env).await;

        let report = self.membership.broadcast(env).await;
        self.metrics.peer_failed(report.failed.len());

        report
    }

    /// Wrap `event` in an envelope sourced from the local broker and
    /// [broadcast](Self::broadcast) it.
    pub async fn emit(&self, event: &Event) -> BroadcastReport {
        let env = Envelope::from_event(self.local_node().as_str(), event);
        self.broadcast(&env).await
    }

    /// Publish an envelope that arrived from a peer broker. It is never forwarded again.
    pub async fn receive_from_peer(&self, env: &Envelope) -> usize {
        debug!("received {} ({}) from {}", env.id(), env.ty(), env.source());
        self.publish(env).await
    }

    /// Deliver `env` to exactly one broker. If that broker is the local one, the envelope is
    /// published locally.
    pub async fn unicast(&self, node: &NodeId, env: &Envelope) -> Result<(), PeerError> {
        if node == self.local_node() {
            self.publish(env).await;
            return Ok(());
        }

        self.membership.unicast(node, env).await.map_err(|e| {
            self.metrics.peer_failed(1);
            e
        })
    }
}

async fn deliver(id: SubscriberId, c: &dyn EventConsumer, env: &Envelope, m: &Metrics) -> bool {
    match c.handle(env).await {
        Ok(()) => true,
        Err(e) => {
            warn!("consumer {} failed on {} ({}): {}", id, env.id(), env.ty(), e);
            m.consumer_failed();
            false
        }
    }
}

async fn drain(
    id: SubscriberId,
    consumer: Arc<dyn EventConsumer>,
    mut rx: UnboundedReceiver<Envelope>,
    metrics: Arc<Metrics>,
) {
    while let Some(env) = rx.recv().await {
        deliver(id, &*consumer, &env, &metrics).await;
    }
    debug!("consumer {} worker exiting", id);
}
