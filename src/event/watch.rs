// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Keyed watch channels that replay recent values to new watchers.
use super::{ConsumerError, Envelope, Event, EventConsumer};
use futures::stream::{unfold, Stream};
use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    sync::{Mutex, PoisonError},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// How many past values a new watcher receives before live updates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Replay {
    /// Only the most recent value.
    Last,
    /// Up to the given number of most recent values, oldest first.
    ///
    /// Must be non-zero.
    All(usize),
}

impl Replay {
    fn capacity(self) -> usize {
        match self {
            Self::Last => 1,
            Self::All(n) => n,
        }
    }
}

struct Slot<V> {
    buf: VecDeque<V>,
    watchers: Vec<UnboundedSender<V>>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            buf: VecDeque::new(),
            watchers: Vec::new(),
        }
    }
}

/// A set of keyed channels with per-key replay buffers.
///
/// Emitting and watching take the same lock, so a new watcher receives the replayed
/// values and then every later emission, with nothing lost or repeated in between.
pub struct WatchHub<K, V> {
    replay: Replay,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> WatchHub<K, V> {
    /// Create an empty hub.
    ///
    /// # Panics
    /// Panics if `replay` is `Replay::All(0)`.
    pub fn new(replay: Replay) -> Self {
        assert_ne!(0, replay.capacity());

        Self {
            replay,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Record `value` for `key` and hand it to every live watcher of `key`.
    ///
    /// Returns the number of watchers it was handed to.
    pub fn emit(&self, key: K, value: V) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key).or_default();

        if slot.buf.len() == self.replay.capacity() {
            slot.buf.pop_front();
        }
        slot.buf.push_back(value.clone());

        slot.watchers.retain(|tx| tx.send(value.clone()).is_ok());
        slot.watchers.len()
    }

    /// Watch `key`. Buffered values are received first.
    pub fn watch(&self, key: &K) -> Watch<V> {
        let (tx, rx) = unbounded_channel();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key.clone()).or_default();

        for v in slot.buf.iter() {
            // NOTE: can't fail, rx is still in scope.
            let _ = tx.send(v.clone());
        }
        slot.watchers.push(tx);

        Watch { rx }
    }

    /// Returns the most recent value emitted for `key`.
    pub fn latest(&self, key: &K) -> Option<V> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key)?.buf.back().cloned()
    }

    /// Returns the number of live watchers of `key`.
    pub fn watchers(&self, key: &K) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = match slots.get_mut(key) {
            Some(slot) => slot,
            None => return 0,
        };

        slot.watchers.retain(|tx| !tx.is_closed());
        slot.watchers.len()
    }
}

/// A live watch on one key of a [WatchHub].
pub struct Watch<V> {
    rx: UnboundedReceiver<V>,
}

impl<V> Watch<V> {
    /// Resolves to the next value, or `None` if the hub was dropped.
    pub async fn recv(&mut self) -> Option<V> {
        self.rx.recv().await
    }

    /// Convert this watch into a [Stream] of values.
    pub fn into_stream(self) -> impl Stream<Item = V> {
        unfold(self, |mut w| async { Some((w.recv().await?, w)) })
    }
}

/// Exposes [ConfigChanged](Event::ConfigChanged) events as per-app watch channels; a new
/// watcher first receives the latest configuration for its app.
pub struct ConfigWatch {
    hub: WatchHub<String, String>,
}

impl Default for ConfigWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigWatch {
    /// Create a config watch with no known configuration.
    pub fn new() -> Self {
        Self {
            hub: WatchHub::new(Replay::Last),
        }
    }

    /// Watch the configuration of `app_name`.
    pub fn watch(&self, app_name: &str) -> Watch<String> {
        self.hub.watch(&app_name.to_owned())
    }

    /// Returns the latest configuration seen for `app_name`.
    pub fn latest(&self, app_name: &str) -> Option<String> {
        self.hub.latest(&app_name.to_owned())
    }
}

#[crate::async_trait]
impl EventConsumer for ConfigWatch {
    fn accepts(&self, ty: &str) -> bool {
        ty == Event::CONFIG_CHANGED
    }

    async fn handle(&self, env: &Envelope) -> Result<(), ConsumerError> {
        if let Some(Event::ConfigChanged(m)) = Event::decode(env)? {
            self.hub.emit(m.app_name, m.content);
        }
        Ok(())
    }
}
