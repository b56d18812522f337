// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Idempotent delivery on top of the bus.
use super::{ConsumerError, Envelope, EventConsumer};
use crate::collections::{unix_millis, EventFilter};
use log::{debug, warn};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

/// Wraps a consumer so that it sees each envelope id at most once within a window.
///
/// The bus itself makes no uniqueness guarantee; an envelope may be redelivered, for
/// instance when two brokers both forward the same retraction. Envelopes older than the
/// window are dropped outright, with a warning, since that usually means the sender's
/// clock is off.
pub struct Dedup<C> {
    inner: C,
    window: Duration,
    seen: Mutex<EventFilter>,
    expired: AtomicU64,
}

impl<C: EventConsumer> Dedup<C> {
    /// Wrap `inner`, remembering ids for `window`.
    pub fn new(inner: C, window: Duration) -> Self {
        Self {
            inner,
            window,
            seen: Mutex::new(EventFilter::new(window)),
            expired: AtomicU64::new(0),
        }
    }

    /// Returns the number of envelopes dropped for being older than the window.
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Returns the wrapped consumer.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[crate::async_trait]
impl<C: EventConsumer> EventConsumer for Dedup<C> {
    fn accepts(&self, ty: &str) -> bool {
        self.inner.accepts(ty)
    }

    async fn handle(&self, env: &Envelope) -> Result<(), ConsumerError> {
        let (id, now) = (env.event_id(), unix_millis());
        let fresh = (self.seen.lock())
            .unwrap_or_else(PoisonError::into_inner)
            .insert_at(id, now);

        if !fresh {
            let age = Duration::from_millis(now.saturating_sub(id.timestamp()));
            if age >= self.window {
                self.expired.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "dropping {} ({}) from {}: {:?} old, outside the {:?} window; is its clock skewed?",
                    env.id(),
                    env.ty(),
                    env.source(),
                    age,
                    self.window,
                );
            } else {
                debug!("dropping duplicate {} ({})", env.id(), env.ty());
            }
            return Ok(());
        }

        self.inner.handle(env).await
    }
}
