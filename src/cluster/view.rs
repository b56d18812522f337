// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Membership views and subscriptions to them.
use super::{BrokerInfo, NodeId};
use arc_swap::ArcSwap;
use fnv::FnvHasher;
use futures::stream::{unfold, Stream};
use std::{
    collections::BTreeSet,
    hash::{Hash, Hasher},
    result,
    sync::{Arc, Mutex, PoisonError, Weak},
};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, Receiver, Sender};

/// An error returned by [recv](Subscription::recv) if the membership source was dropped.
///
/// If this error is received, the local broker can be assumed to have stopped executing.
#[derive(Copy, Clone, Debug, Error)]
#[error("closed")]
pub struct Closed;

/// A single membership transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent<'a> {
    /// A broker joined the cluster.
    Joined(&'a BrokerInfo),
    /// A broker left the cluster.
    Left(&'a BrokerInfo),
}

/// A snapshot of cluster membership, and how it differs from the previous one. Cloning
/// this is cheap, as membership information is stored as refcounted slices.
#[derive(Clone, Debug)]
pub struct ClusterChange {
    pub(crate) skipped: u64,
    pub(crate) epoch: u64,
    pub(crate) local: BrokerInfo,
    pub(crate) members: Arc<[BrokerInfo]>,
    pub(crate) joined: Arc<[BrokerInfo]>,
    pub(crate) left: Arc<[BrokerInfo]>,
}

impl ClusterChange {
    /// Returns the number of changes that were skipped between this and the last received
    /// change.
    ///
    /// If this isn't 0, [joined](Self::joined) and [left](Self::left) most likely do not
    /// represent the complete set of membership changes since the last one received.
    ///
    /// On the other hand, [members](Self::members) will always be complete.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Returns a hash of the member set. Equal member sets have equal epochs.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns the local broker.
    pub fn local_broker(&self) -> &BrokerInfo {
        &self.local
    }

    /// Returns all members, sorted by node id. Always includes the local broker.
    pub fn members(&self) -> &Arc<[BrokerInfo]> {
        &self.members
    }

    /// Returns any brokers that joined.
    pub fn joined(&self) -> &Arc<[BrokerInfo]> {
        &self.joined
    }

    /// Returns any brokers that left.
    pub fn left(&self) -> &Arc<[BrokerInfo]> {
        &self.left
    }

    /// Returns an iterator over all members except the local broker.
    pub fn peers(&self) -> impl Iterator<Item = &BrokerInfo> {
        let local = self.local.node_id();
        self.members.iter().filter(move |b| b.node_id() != local)
    }

    /// Returns an iterator over every transition in this change; joins first.
    pub fn events(&self) -> impl Iterator<Item = MembershipEvent<'_>> {
        (self.joined.iter().map(MembershipEvent::Joined))
            .chain(self.left.iter().map(MembershipEvent::Left))
    }

    /// Lookup a specific member by node id.
    ///
    /// Executes in O(log n) time.
    pub fn lookup(&self, node: &NodeId) -> Option<&BrokerInfo> {
        self.members
            .binary_search_by(|b| b.node_id().cmp(node))
            .ok()
            .map(|i| &self.members[i])
    }

    /// Build the initial view, in which every member counts as having joined.
    fn initial(local: BrokerInfo, members: Vec<BrokerInfo>) -> Self {
        let members: Arc<[BrokerInfo]> = normalize(&local, members).into();

        Self {
            skipped: 0,
            epoch: epoch_of(&members),
            local,
            joined: Arc::clone(&members),
            left: Arc::new([]),
            members,
        }
    }

    /// Diff `members` against this view. Returns `None` if nothing changed.
    fn next(&self, members: Vec<BrokerInfo>) -> Option<Self> {
        let members = normalize(&self.local, members);

        let prev: BTreeSet<&BrokerInfo> = self.members.iter().collect();
        let next: BTreeSet<&BrokerInfo> = members.iter().collect();

        let joined: Vec<_> = next.difference(&prev).map(|b| (*b).clone()).collect();
        let left: Vec<_> = prev.difference(&next).map(|b| (*b).clone()).collect();

        guard!(!joined.is_empty() || !left.is_empty());

        let members: Arc<[BrokerInfo]> = members.into();

        Some(Self {
            skipped: 0,
            epoch: epoch_of(&members),
            local: self.local.clone(),
            members,
            joined: joined.into(),
            left: left.into(),
        })
    }
}

/// Sort and dedupe `members` by node id, making sure the local broker is included (and
/// that its own identity wins over whatever discovery reported for it).
fn normalize(local: &BrokerInfo, mut members: Vec<BrokerInfo>) -> Vec<BrokerInfo> {
    members.retain(|b| b != local);
    members.push(local.clone());
    members.sort();
    members.dedup();
    members
}

fn epoch_of(members: &[BrokerInfo]) -> u64 {
    let mut h = FnvHasher::default();
    members.iter().for_each(|b| b.node_id().hash(&mut h));
    h.finish()
}

/// Owns the current view and fans changes out to subscribers.
///
/// The sender lives behind a mutex that is held while swapping in a new view and while
/// subscribing, so a subscriber's initial snapshot and its first delta never overlap.
pub(crate) struct ViewPublisher {
    view: ArcSwap<ClusterChange>,
    tx: Mutex<Sender<ClusterChange>>,
}

impl ViewPublisher {
    pub(crate) fn new(local: BrokerInfo, members: Vec<BrokerInfo>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(16);
        let view = ClusterChange::initial(local, members);

        Arc::new(Self {
            view: ArcSwap::from_pointee(view),
            tx: Mutex::new(tx),
        })
    }

    /// Returns the current view.
    #[inline]
    pub(crate) fn current(&self) -> Arc<ClusterChange> {
        self.view.load_full()
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let rx = tx.subscribe();

        let mut primed = ClusterChange::clone(&self.view.load());
        primed.joined = Arc::clone(&primed.members);
        primed.left = Arc::new([]);

        Subscription {
            view: Arc::downgrade(self),
            rx,
            primed: Some(primed),
        }
    }

    /// Replace the member set. Returns the change if membership actually changed.
    pub(crate) fn publish(&self, members: Vec<BrokerInfo>) -> Option<ClusterChange> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let change = self.view.load().next(members)?;

        self.view.store(Arc::new(change.clone()));
        // NOTE: this fails if there are no subscribers, which is fine.
        let _ = tx.send(change.clone());
        drop(tx);

        Some(change)
    }
}

/// A subscription to membership changes.
///
/// The first item received is always the membership view at the time of subscribing, with
/// every member listed as [joined](ClusterChange::joined). Resubscribing is always possible
/// and starts over from the current view.
pub struct Subscription {
    view: Weak<ViewPublisher>,
    rx: Receiver<ClusterChange>,
    primed: Option<ClusterChange>,
}

impl Subscription {
    /// Resolves when the next membership change is published, or the subscription ends.
    pub async fn recv(&mut self) -> result::Result<ClusterChange, Closed> {
        if let Some(initial) = self.primed.take() {
            return Ok(initial);
        }

        let n = match self.rx.recv().await {
            Ok(change) => {
                return Ok(change);
            }

            Err(RecvError::Closed) => {
                return Err(Closed);
            }

            Err(RecvError::Lagged(n)) => n,
        };

        let view = self.view.upgrade().ok_or(Closed)?;
        let mut change = ClusterChange::clone(&view.current());
        change.skipped = n;

        Ok(change)
    }

    /// Convert this subscription into a [Stream] of membership changes.
    pub fn into_stream(self) -> impl Stream<Item = ClusterChange> {
        unfold(self, |mut s| async { Some((s.recv().await.ok()?, s)) })
    }

    /// Borrow this subscription as a [Stream] of membership changes.
    pub fn as_stream(&mut self) -> impl Stream<Item = ClusterChange> + '_ {
        unfold(self, |s| async { Some((s.recv().await.ok()?, s)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::broker;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn late_subscribers_see_current_view_first() {
        let publisher = ViewPublisher::new(broker("a", 1), vec![]);
        publisher.publish(vec![broker("b", 2)]).unwrap();

        let mut sub = publisher.subscribe();
        let first = sub.recv().await.unwrap();

        assert_eq!(2, first.members().len());
        assert_eq!(first.members(), first.joined());
        assert!(first.left().is_empty());
    }

    #[tokio::test]
    async fn deltas_follow_the_snapshot() {
        let publisher = ViewPublisher::new(broker("a", 1), vec![broker("b", 2)]);
        let mut sub = publisher.subscribe();
        sub.recv().await.unwrap();

        publisher.publish(vec![broker("c", 3)]).unwrap();
        let change = sub.recv().await.unwrap();

        let ids = |bs: &[BrokerInfo]| bs.iter().map(|b| b.node_id().to_string()).collect::<Vec<_>>();
        assert_eq!(ids(change.joined()), vec!["c"]);
        assert_eq!(ids(change.left()), vec!["b"]);
        assert_eq!(ids(change.members()), vec!["a", "c"]);
        assert_eq!(2, change.events().count());
    }

    #[tokio::test]
    async fn unchanged_membership_publishes_nothing() {
        let publisher = ViewPublisher::new(broker("a", 1), vec![broker("b", 2)]);
        let mut sub = publisher.subscribe();
        sub.recv().await.unwrap();

        let epoch = publisher.current().epoch();
        assert!(publisher.publish(vec![broker("b", 9), broker("a", 1)]).is_none());
        assert_eq!(epoch, publisher.current().epoch());

        timeout(Duration::from_millis(20), sub.recv())
            .await
            .unwrap_err();
    }

    #[test]
    fn local_broker_is_always_a_member() {
        let publisher = ViewPublisher::new(broker("a", 1), vec![]);
        publisher.publish(vec![broker("b", 2)]).unwrap();

        let view = publisher.publish(vec![]).unwrap();
        assert_eq!(1, view.members().len());
        assert!(view.lookup(&"a".into()).is_some());
        assert_eq!(0, view.peers().count());
    }

    #[tokio::test]
    async fn lagging_subscribers_get_the_latest_view() {
        let publisher = ViewPublisher::new(broker("a", 1), vec![]);
        let mut sub = publisher.subscribe();
        sub.recv().await.unwrap();

        for i in 0..40u16 {
            let id = format!("n{}", i);
            publisher.publish(vec![broker(&id, i)]).unwrap();
        }

        let change = sub.recv().await.unwrap();
        assert!(change.skipped() > 0);
        assert!(change.lookup(&"n39".into()).is_some());
    }
}
