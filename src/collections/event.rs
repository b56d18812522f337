// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
use fnv::FnvHasher;
use rand::random;
use std::{
    cmp::Reverse,
    collections::BTreeSet,
    convert::TryFrom,
    fmt,
    hash::Hasher,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Returns the current time as milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    let since = (SystemTime::now().duration_since(UNIX_EPOCH)).unwrap_or_default();
    u64::try_from(since.as_millis()).unwrap_or(u64::MAX)
}

/// An envelope id: the millisecond it was minted at, plus a random component.
///
/// Renders as `<millis as hex>-<uniq as 16 hex digits>`. Ids order newest first.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Id {
    at: u64,
    uniq: u64,
}

derive_cmp_with!(Id, id => Reverse((id.at, id.uniq)));

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:016x}", self.at, self.uniq)
    }
}

/// Returned when parsing an [Id] from a string that wasn't produced by one.
#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("malformed event id")]
pub struct MalformedId;

impl FromStr for Id {
    type Err = MalformedId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = |part: &str| u64::from_str_radix(part, 16).map_err(|_| MalformedId);
        let (at, uniq) = s.split_once('-').ok_or(MalformedId)?;
        Ok(Self::new(hex(at)?, hex(uniq)?))
    }
}

impl Id {
    /// Reassemble an id from its parts.
    pub const fn new(at: u64, uniq: u64) -> Self {
        Self { at, uniq }
    }

    /// Mint a fresh id.
    pub fn generate() -> Self {
        Self::new(unix_millis(), random())
    }

    /// Hash a foreign id string into an [Id] minted at `at` (unix millis).
    pub fn derive(at: u64, foreign: &str) -> Self {
        let mut h = FnvHasher::default();
        h.write(foreign.as_bytes());
        Self::new(at, h.finish())
    }

    /// Returns when this id was minted, in milliseconds since the unix epoch.
    pub const fn timestamp(&self) -> u64 {
        self.at
    }

    /// Returns the random component.
    pub const fn unique(&self) -> u64 {
        self.uniq
    }
}

/// Remembers the ids seen within a sliding window, and rejects repeats.
///
/// Ids minted before the window are rejected outright and never stored, so the filter only
/// ever holds ids from the last `window`.
pub struct Filter {
    seen: BTreeSet<Id>,
    window: u64,
}

impl Filter {
    /// Create a filter over a window of `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            seen: BTreeSet::new(),
            window: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Record `id` as of `now` (unix millis). Returns true if it is inside the window and
    /// hasn't been recorded before.
    pub fn insert_at(&mut self, id: Id, now: u64) -> bool {
        let cutoff = now.saturating_sub(self.window);

        // newest first: everything from the oldest id minted at `cutoff` onward is stale.
        self.seen.split_off(&Id::new(cutoff, u64::MAX));

        id.at > cutoff && self.seen.insert(id)
    }

    /// Returns the number of ids held.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
