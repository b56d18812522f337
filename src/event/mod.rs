// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Event envelopes and the bus that distributes them.
//!
//! Everything that changes routing state travels as an [Envelope]: a small immutable
//! record whose `type` names the schema of its payload. The [EventBus] hands envelopes to
//! local [consumers](EventConsumer) and, for locally originated envelopes, to every peer
//! broker in the cluster.
//!
//! The well-known types understood by this crate decode into [Event]. Types that aren't
//! known decode to `None`; newer peers are free to emit types older ones don't understand.
pub mod bus;
pub mod dedup;
pub mod watch;

pub use bus::{
    ConsumerError, DeliveryPolicy, EventBus, EventConsumer, FnConsumer, SubscriberId, TypeMatcher,
};
pub use dedup::Dedup;
pub use watch::{ConfigWatch, Replay, Watch, WatchHub};

#[doc(inline)]
pub use crate::collections::EventId;

use crate::{cluster::proto, collections::unix_millis};
use bytes::Bytes;
use prost::Message;
use std::{collections::BTreeMap, fmt, sync::Arc};
use thiserror::Error;

/// An immutable event envelope. Cloning is cheap.
#[derive(Clone, PartialEq)]
pub struct Envelope(Arc<Inner>);

#[derive(PartialEq)]
struct Inner {
    id: String,
    ty: String,
    source: String,
    occurred_at: u64,
    payload: Bytes,
    extensions: BTreeMap<String, String>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.0.id)
            .field("type", &self.0.ty)
            .field("source", &self.0.source)
            .field("occurred_at", &self.0.occurred_at)
            .field("payload", &self.0.payload.len())
            .finish()
    }
}

impl Envelope {
    /// Create a new envelope with a freshly generated id, timestamped now.
    pub fn new<T, S>(ty: T, source: S, payload: Bytes) -> Self
    where
        T: Into<String>,
        S: Into<String>,
    {
        Self(Arc::new(Inner {
            id: EventId::generate().to_string(),
            ty: ty.into(),
            source: source.into(),
            occurred_at: unix_millis(),
            payload,
            extensions: BTreeMap::new(),
        }))
    }

    /// Wrap a well-known event.
    pub fn from_event<S: Into<String>>(source: S, event: &Event) -> Self {
        Self::new(event.tag(), source, event.encode())
    }

    /// Returns a copy of this envelope with `exts` added to its extensions.
    pub fn with_extensions<I, K, V>(self, exts: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut inner = Arc::try_unwrap(self.0).unwrap_or_else(|shared| Inner {
            id: shared.id.clone(),
            ty: shared.ty.clone(),
            source: shared.source.clone(),
            occurred_at: shared.occurred_at,
            payload: shared.payload.clone(),
            extensions: shared.extensions.clone(),
        });

        (inner.extensions).extend(exts.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self(Arc::new(inner))
    }

    /// Returns the id of this envelope. Unique per emission.
    pub fn id(&self) -> &str {
        &self.0.id
    }

    /// Returns the id as an [EventId]. Ids that weren't generated by this crate are hashed
    /// into one, timestamped at `occurred_at`.
    pub fn event_id(&self) -> EventId {
        (self.0.id.parse())
            .unwrap_or_else(|_| EventId::derive(self.0.occurred_at, &self.0.id))
    }

    /// Returns the type tag, which names the schema of the payload.
    pub fn ty(&self) -> &str {
        &self.0.ty
    }

    /// Returns where this envelope originated (usually a node id).
    pub fn source(&self) -> &str {
        &self.0.source
    }

    /// Returns when this envelope was created, in milliseconds since the unix epoch.
    pub fn occurred_at(&self) -> u64 {
        self.0.occurred_at
    }

    /// Returns the encoded payload.
    pub fn payload(&self) -> &Bytes {
        &self.0.payload
    }

    /// Returns an extension attribute.
    pub fn extension(&self, key: &str) -> Option<&str> {
        self.0.extensions.get(key).map(String::as_str)
    }

    /// Returns all extension attributes.
    pub fn extensions(&self) -> &BTreeMap<String, String> {
        &self.0.extensions
    }
}

impl From<&Envelope> for proto::Envelope {
    fn from(env: &Envelope) -> Self {
        Self {
            id: env.0.id.clone(),
            r#type: env.0.ty.clone(),
            source: env.0.source.clone(),
            occurred_at: env.0.occurred_at,
            payload: env.0.payload.to_vec(),
            extensions: (env.0.extensions.iter())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl From<proto::Envelope> for Envelope {
    fn from(p: proto::Envelope) -> Self {
        Self(Arc::new(Inner {
            id: p.id,
            ty: p.r#type,
            source: p.source,
            occurred_at: p.occurred_at,
            payload: p.payload.into(),
            extensions: p.extensions.into_iter().collect(),
        }))
    }
}

/// An error decoding the payload of a well-known event.
#[derive(Debug, Error)]
#[error("malformed {ty} payload: {source}")]
pub struct DecodeError {
    ty: &'static str,
    source: prost::DecodeError,
}

/// The well-known events.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// An app started providing some services.
    ServiceExposed(proto::ServiceExposed),
    /// An app stopped providing some services.
    ServiceRetracted(proto::ServiceRetracted),
    /// An app's lifecycle status changed.
    AppStatusChanged(proto::AppStatusChanged),
    /// Configuration for an app changed. Forwarded, not interpreted.
    ConfigChanged(proto::ConfigChanged),
    /// Some cache keys went stale. Forwarded, not interpreted.
    CacheInvalidate(proto::CacheInvalidate),
}

impl Event {
    /// Type tag of [Event::ServiceExposed].
    pub const SERVICE_EXPOSED: &'static str = "io.switchyard.service.exposed";
    /// Type tag of [Event::ServiceRetracted].
    pub const SERVICE_RETRACTED: &'static str = "io.switchyard.service.retracted";
    /// Type tag of [Event::AppStatusChanged].
    pub const APP_STATUS: &'static str = "io.switchyard.app.status";
    /// Type tag of [Event::ConfigChanged].
    pub const CONFIG_CHANGED: &'static str = "io.switchyard.config.changed";
    /// Type tag of [Event::CacheInvalidate].
    pub const CACHE_INVALIDATE: &'static str = "io.switchyard.cache.invalidate";

    /// Returns the stable type tag of this event.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ServiceExposed(_) => Self::SERVICE_EXPOSED,
            Self::ServiceRetracted(_) => Self::SERVICE_RETRACTED,
            Self::AppStatusChanged(_) => Self::APP_STATUS,
            Self::ConfigChanged(_) => Self::CONFIG_CHANGED,
            Self::CacheInvalidate(_) => Self::CACHE_INVALIDATE,
        }
    }

    /// Returns true if `ty` is the tag of a well-known event.
    pub fn is_known(ty: &str) -> bool {
        matches!(
            ty,
            Self::SERVICE_EXPOSED
                | Self::SERVICE_RETRACTED
                | Self::APP_STATUS
                | Self::CONFIG_CHANGED
                | Self::CACHE_INVALIDATE
        )
    }

    /// Encode the payload of this event.
    pub fn encode(&self) -> Bytes {
        let buf = match self {
            Self::ServiceExposed(m) => m.encode_to_vec(),
            Self::ServiceRetracted(m) => m.encode_to_vec(),
            Self::AppStatusChanged(m) => m.encode_to_vec(),
            Self::ConfigChanged(m) => m.encode_to_vec(),
            Self::CacheInvalidate(m) => m.encode_to_vec(),
        };
        buf.into()
    }

    /// Decode the well-known event carried by `env`.
    ///
    /// Resolves to `Ok(None)` if the envelope's type isn't a well-known one.
    pub fn decode(env: &Envelope) -> Result<Option<Self>, DecodeError> {
        fn de<M: Message + Default>(ty: &'static str, env: &Envelope) -> Result<M, DecodeError> {
            M::decode(env.payload().clone()).map_err(|source| DecodeError { ty, source })
        }

        let ev = match env.ty() {
            Self::SERVICE_EXPOSED => Self::ServiceExposed(de(Self::SERVICE_EXPOSED, env)?),
            Self::SERVICE_RETRACTED => Self::ServiceRetracted(de(Self::SERVICE_RETRACTED, env)?),
            Self::APP_STATUS => Self::AppStatusChanged(de(Self::APP_STATUS, env)?),
            Self::CONFIG_CHANGED => Self::ConfigChanged(de(Self::CONFIG_CHANGED, env)?),
            Self::CACHE_INVALIDATE => Self::CacheInvalidate(de(Self::CACHE_INVALIDATE, env)?),
            _ => return Ok(None),
        };

        Ok(Some(ev))
    }
}
