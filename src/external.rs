// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Collaborators the broker relies on but doesn't implement.
//!
//! Credential verification, configuration storage and application caches live outside
//! this crate. The broker only needs the narrow interfaces below, plus the bus consumers
//! that forward [ConfigChanged](Event::ConfigChanged) and
//! [CacheInvalidate](Event::CacheInvalidate) events to them.
use crate::event::{ConsumerError, Envelope, Event, EventConsumer, Replay, WatchHub};
use futures::stream::{BoxStream, StreamExt};
use log::debug;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;

/// An authenticated caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Principal {
    /// Who the caller is.
    pub subject: String,
    /// Roles granted to the caller.
    pub roles: Vec<String>,
    /// Organizations the caller belongs to.
    pub organizations: Vec<String>,
    /// Service accounts the caller may act as.
    pub service_accounts: Vec<String>,
    /// Who the credentials were issued for.
    pub audience: Vec<String>,
}

impl Principal {
    /// Create a principal for `subject` with no claims.
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_owned(),
            ..Default::default()
        }
    }

    /// Returns true if the principal was granted `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// An error authenticating a caller.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The credentials were malformed, expired or not recognized.
    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Verifies opaque credentials.
#[crate::async_trait]
pub trait AuthenticationService: Send + Sync + 'static {
    /// Returns the principal `credentials` identify.
    async fn authenticate(&self, credentials: &str) -> Result<Principal, AuthError>;
}

/// An error raised by a [ConfigStore].
#[derive(Clone, Debug, Error)]
#[error("config store: {0}")]
pub struct ConfigError(pub String);

/// Scoped key-value configuration storage.
#[crate::async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    /// Returns the value of `key` in `scope`.
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>, ConfigError>;

    /// Set the value of `key` in `scope`.
    async fn put(&self, scope: &str, key: &str, value: &str) -> Result<(), ConfigError>;

    /// Remove `key` from `scope`. Returns true if it was present.
    async fn remove(&self, scope: &str, key: &str) -> Result<bool, ConfigError>;

    /// Watch `key` in `scope`. The latest value (if any) is yielded first; `None` marks
    /// a removal.
    fn watch(&self, scope: &str, key: &str) -> BoxStream<'static, Option<String>>;
}

type ScopedKey = (String, String);

/// A [ConfigStore] that keeps everything in memory. Nothing survives a restart.
pub struct MemoryConfigStore {
    values: Mutex<HashMap<ScopedKey, String>>,
    hub: WatchHub<ScopedKey, Option<String>>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self {
            values: Mutex::default(),
            hub: WatchHub::new(Replay::Last),
        }
    }
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(scope: &str, key: &str) -> ScopedKey {
        (scope.to_owned(), key.to_owned())
    }
}

#[crate::async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>, ConfigError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(&Self::key(scope, key)).cloned())
    }

    async fn put(&self, scope: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        let k = Self::key(scope, key);
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(k.clone(), value.to_owned());
        self.hub.emit(k, Some(value.to_owned()));
        Ok(())
    }

    async fn remove(&self, scope: &str, key: &str) -> Result<bool, ConfigError> {
        let k = Self::key(scope, key);
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let existed = values.remove(&k).is_some();
        if existed {
            self.hub.emit(k, None);
        }
        Ok(existed)
    }

    fn watch(&self, scope: &str, key: &str) -> BoxStream<'static, Option<String>> {
        self.hub.watch(&Self::key(scope, key)).into_stream().boxed()
    }
}

/// Forwards [ConfigChanged](Event::ConfigChanged) events to a [ConfigStore], keyed by app
/// name within a fixed scope.
pub struct ConfigForwarder {
    store: Arc<dyn ConfigStore>,
    scope: String,
}

impl ConfigForwarder {
    /// Forward into `scope` of `store`.
    pub fn new(store: Arc<dyn ConfigStore>, scope: &str) -> Self {
        Self {
            store,
            scope: scope.to_owned(),
        }
    }
}

#[crate::async_trait]
impl EventConsumer for ConfigForwarder {
    fn accepts(&self, ty: &str) -> bool {
        ty == Event::CONFIG_CHANGED
    }

    async fn handle(&self, env: &Envelope) -> Result<(), ConsumerError> {
        if let Some(Event::ConfigChanged(m)) = Event::decode(env)? {
            debug!("forwarding config of {} from {}", m.app_name, env.source());
            (self.store.put(&self.scope, &m.app_name, &m.content).await)
                .map_err(ConsumerError::failed)?;
        }
        Ok(())
    }
}

/// An error raised by a [CacheInvalidator].
#[derive(Clone, Debug, Error)]
#[error("cache invalidation failed: {0}")]
pub struct InvalidateError(pub String);

/// An application cache that can drop stale keys.
#[crate::async_trait]
pub trait CacheInvalidator: Send + Sync + 'static {
    /// Drop `keys`.
    async fn invalidate(&self, keys: &[String]) -> Result<(), InvalidateError>;
}

/// Forwards [CacheInvalidate](Event::CacheInvalidate) events to a [CacheInvalidator].
pub struct CacheForwarder {
    cache: Arc<dyn CacheInvalidator>,
}

impl CacheForwarder {
    /// Forward to `cache`.
    pub fn new(cache: Arc<dyn CacheInvalidator>) -> Self {
        Self { cache }
    }
}

#[crate::async_trait]
impl EventConsumer for CacheForwarder {
    fn accepts(&self, ty: &str) -> bool {
        ty == Event::CACHE_INVALIDATE
    }

    async fn handle(&self, env: &Envelope) -> Result<(), ConsumerError> {
        match Event::decode(env)? {
            Some(Event::CacheInvalidate(m)) if !m.keys.is_empty() => {
                (self.cache.invalidate(&m.keys).await).map_err(ConsumerError::failed)
            }
            _ => Ok(()),
        }
    }
}
