// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! A single destination's pool of endpoints.
use super::{DestinationKey, Endpoint, NoAvailableEndpoint};
use crate::registry::{EndpointId, MAX_WEIGHT};
use arc_swap::ArcSwap;
use log::{debug, info};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc, Mutex, PoisonError,
    },
    time::Instant,
};

/// The lifecycle of an [UpstreamCluster].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Created, but no endpoint was ever added.
    Uninitialized,
    /// Has (or recently had) endpoints; selection is served.
    Active,
    /// The last endpoint was removed. Selection fails fast until an endpoint is added, or
    /// the pool is reaped.
    Draining,
    /// Reaped. The pool will never serve again.
    Removed,
}

/// A snapshot of the selection ring. Every ring owns its cursor, so a cursor can only ever
/// index the ring it was created for.
struct Ring {
    slots: Box<[Arc<dyn Endpoint>]>,
    cursor: AtomicUsize,
}

impl Ring {
    fn empty() -> Self {
        Self {
            slots: Box::new([]),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Interleave members by round: an endpoint of weight `w` occupies one slot in each of
    /// the first `w` rounds. `cursor` is carried over from the previous ring, and reset if
    /// it would be out of bounds.
    fn build(members: &[Member], cursor: usize) -> Self {
        let rounds = members.iter().map(|m| m.weight).max().unwrap_or(0);
        let mut slots = Vec::new();

        for r in 0..rounds {
            let live = members.iter().filter(|m| m.weight > r);
            slots.extend(live.map(|m| Arc::clone(&m.endpoint)));
        }

        let cursor = if cursor < slots.len() { cursor } else { 0 };

        Self {
            slots: slots.into(),
            cursor: AtomicUsize::new(cursor),
        }
    }

    fn next(&self) -> Option<Arc<dyn Endpoint>> {
        let len = self.slots.len();
        guard!(len > 0);

        let prev = (self.cursor)
            .fetch_update(Relaxed, Relaxed, |c| Some((c + 1) % len))
            .unwrap_or_else(|c| c);

        debug_assert!(prev < len, "stale cursor {} for a ring of {}", prev, len);
        self.slots.get(prev).cloned()
    }
}

struct Member {
    endpoint: Arc<dyn Endpoint>,
    weight: u32,
}

struct State {
    phase: Phase,
    members: Vec<Member>,
    drained_at: Option<Instant>,
}

/// The endpoints serving one destination, and weighted round-robin selection over them.
///
/// Selection is lock-free: it loads the current ring and advances its cursor. Mutations
/// are serialized by a per-pool lock and swap in a freshly built ring.
pub struct UpstreamCluster {
    key: DestinationKey,
    ring: ArcSwap<Ring>,
    state: Mutex<State>,
}

impl UpstreamCluster {
    /// Create an empty, uninitialized pool for `key`.
    pub fn new(key: DestinationKey) -> Self {
        Self {
            key,
            ring: ArcSwap::from_pointee(Ring::empty()),
            state: Mutex::new(State {
                phase: Phase::Uninitialized,
                members: Vec::new(),
                drained_at: None,
            }),
        }
    }

    /// Returns the destination this pool serves.
    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    /// Select the next endpoint.
    pub fn select(&self) -> Result<Arc<dyn Endpoint>, NoAvailableEndpoint> {
        (self.ring.load().next()).ok_or_else(|| NoAvailableEndpoint(self.key.clone()))
    }

    /// Returns the current phase.
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Returns when the pool started draining, if it is draining.
    pub fn drained_at(&self) -> Option<Instant> {
        self.lock().drained_at
    }

    /// Returns the number of distinct endpoints.
    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    /// Returns true if there are no endpoints.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of slots in the selection ring (the sum of all weights).
    pub fn ring_len(&self) -> usize {
        self.ring.load().slots.len()
    }

    /// Returns the ids of all endpoints, in insertion order.
    pub fn endpoints(&self) -> Vec<EndpointId> {
        (self.lock().members.iter())
            .map(|m| m.endpoint.id().clone())
            .collect()
    }

    /// Returns the endpoint with id `id`.
    pub fn get(&self, id: &EndpointId) -> Option<Arc<dyn Endpoint>> {
        (self.lock().members.iter())
            .find(|m| m.endpoint.id() == id)
            .map(|m| Arc::clone(&m.endpoint))
    }

    /// Add an endpoint, replacing any with the same id. The weight is clamped to
    /// `1..=MAX_WEIGHT`. Returns false if the pool was already reaped.
    pub fn add(&self, endpoint: Arc<dyn Endpoint>, weight: u32) -> bool {
        let mut state = self.lock();
        if state.phase == Phase::Removed {
            return false;
        }

        let member = Member {
            endpoint,
            weight: weight.clamp(1, MAX_WEIGHT),
        };

        let id = member.endpoint.id().clone();
        match state.members.iter_mut().find(|m| *m.endpoint.id() == id) {
            Some(m) => *m = member,
            None => state.members.push(member),
        }

        if state.phase != Phase::Active {
            info!("{} is active", self.key);
        }
        state.phase = Phase::Active;
        state.drained_at = None;

        self.rebuild(&state);
        debug!("added {} to {}", id, self.key);
        true
    }

    /// Remove an endpoint. Returns true if it was present.
    pub fn remove(&self, id: &EndpointId) -> bool {
        let mut state = self.lock();

        let before = state.members.len();
        state.members.retain(|m| m.endpoint.id() != id);
        if before == state.members.len() {
            return false;
        }

        if state.members.is_empty() && state.phase == Phase::Active {
            info!("{} is draining", self.key);
            state.phase = Phase::Draining;
            state.drained_at = Some(Instant::now());
        }

        self.rebuild(&state);
        debug!("removed {} from {}", id, self.key);
        true
    }

    /// Mark this pool as reaped. Only empty pools can be reaped.
    pub(crate) fn mark_removed(&self) -> bool {
        let mut state = self.lock();
        if !state.members.is_empty() {
            return false;
        }

        state.phase = Phase::Removed;
        self.ring.store(Arc::new(Ring::empty()));
        true
    }

    fn rebuild(&self, state: &State) {
        let cursor = self.ring.load().cursor.load(Relaxed);
        self.ring.store(Arc::new(Ring::build(&state.members, cursor)));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
