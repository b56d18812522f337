// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Group/service/version addressing.
//!
//! Every service is referenced by a [ServiceLocator], and every locator has a canonical
//! 64-bit id. Ids are computed with FNV-1a, which is unseeded, so the same triple hashes
//! to the same id on every broker in a cluster regardless of build or process.
use crate::cluster::proto;
use fnv::FnvHasher;
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Stands in for an empty group or version in the canonical form.
pub const SENTINEL: &str = "_";

const SEP: char = '#';
const ESC: char = '\\';

#[inline]
fn normalize(s: &str) -> &str {
    let s = s.trim();
    if s.is_empty() {
        SENTINEL
    } else {
        s
    }
}

fn push_escaped(out: &mut String, field: &str) {
    for c in field.chars() {
        if c == SEP || c == ESC {
            out.push(ESC);
        }
        out.push(c);
    }
}

/// Returns the canonical `group#service#version` form of a triple.
///
/// A `#` or `\` inside a field is escaped with `\`, so distinct triples never share a
/// canonical form.
pub fn gsv(group: &str, service: &str, version: &str) -> String {
    let (g, s, v) = (normalize(group), service.trim(), normalize(version));
    let mut out = String::with_capacity(g.len() + s.len() + v.len() + 2);
    push_escaped(&mut out, g);
    out.push(SEP);
    push_escaped(&mut out, s);
    out.push(SEP);
    push_escaped(&mut out, v);
    out
}

/// Split a canonical form on its unescaped separators, unescaping each field.
fn split_canonical(s: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        let c = match c {
            ESC => match chars.next() {
                Some(c) => c,
                None => break,
            },
            SEP => {
                fields.push(String::new());
                continue;
            }
            c => c,
        };
        if let Some(f) = fields.last_mut() {
            f.push(c);
        }
    }
    fields
}

/// Returns the canonical id of a triple.
pub fn locator_id(group: &str, service: &str, version: &str) -> u64 {
    fnv1a(gsv(group, service, version).as_bytes())
}

#[inline]
fn fnv1a(bytes: &[u8]) -> u64 {
    // Hasher::write on FnvHasher is plain FNV-1a over the bytes (no length prefix).
    let mut h = FnvHasher::default();
    h.write(bytes);
    h.finish()
}

/// An immutable (group, service, version) address.
///
/// Cloning is cheap; the fields are refcounted. Equality and hashing go through the
/// canonical id, so `("", "Foo", "")` and `("_", "Foo", "_")` are the same locator.
#[derive(Clone)]
pub struct ServiceLocator {
    id: u64,
    group: Arc<str>,
    service: Arc<str>,
    version: Arc<str>,
}

impl PartialEq for ServiceLocator {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceLocator {}

impl Hash for ServiceLocator {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Debug for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceLocator({})", self)
    }
}

impl fmt::Display for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&gsv(&self.group, &self.service, &self.version))
    }
}

impl ServiceLocator {
    /// Create a new locator. Empty `group` or `version` are normalized.
    pub fn new(group: &str, service: &str, version: &str) -> Self {
        Self {
            id: locator_id(group, service, version),
            group: normalize(group).into(),
            service: service.trim().into(),
            version: normalize(version).into(),
        }
    }

    /// Parse either the canonical `group#service#version` form, the shorthand
    /// `group:service:version`, or a bare service name.
    ///
    /// Returns `None` if the service component is empty.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<String> = if s.contains(SEP) {
            split_canonical(s)
        } else {
            s.split(':').map(str::to_owned).collect()
        };

        let (g, svc, v) = match parts.as_slice() {
            [svc] => ("", svc.as_str(), ""),
            [g, svc] => (g.as_str(), svc.as_str(), ""),
            [g, svc, v] => (g.as_str(), svc.as_str(), v.as_str()),
            _ => return None,
        };

        guard!(!svc.trim().is_empty());
        Some(Self::new(g, svc, v))
    }

    /// Returns the canonical id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the group, or [SENTINEL] if none was given.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Returns the service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the version, or [SENTINEL] if none was given.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns a locator for the same group and service at `version`.
    pub fn with_version(&self, version: &str) -> Self {
        Self::new(&self.group, &self.service, version)
    }
}

impl From<&ServiceLocator> for proto::Locator {
    fn from(l: &ServiceLocator) -> Self {
        Self {
            group: l.group.to_string(),
            service: l.service.to_string(),
            version: l.version.to_string(),
        }
    }
}

impl From<&proto::Locator> for ServiceLocator {
    fn from(l: &proto::Locator) -> Self {
        Self::new(&l.group, &l.service, &l.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn empty_fields_are_normalized() {
        assert_eq!(locator_id("", "Foo", ""), locator_id("", "Foo", ""));
        assert_eq!(locator_id("", "Foo", ""), locator_id("_", "Foo", "_"));
        assert_ne!(locator_id("", "Foo", ""), locator_id("g", "Foo", "v"));
        assert_eq!(gsv("", "Foo", ""), "_#Foo#_");
    }

    #[test]
    fn id_is_fnv1a_of_canonical_form() {
        // FNV-1a 64 of the empty string is the offset basis.
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(locator_id("g", "S", "v"), fnv1a(b"g#S#v"));
    }

    #[test]
    fn separators_inside_fields_are_escaped() {
        assert_ne!(locator_id("a#b", "c", "v"), locator_id("a", "b#c", "v"));
        assert_eq!(gsv("a#b", "c\\", "v"), "a\\#b#c\\\\#v");

        let l = ServiceLocator::new("a#b", "c\\", "v#");
        assert_eq!(Some(l.clone()), ServiceLocator::parse(&l.to_string()));
        assert_eq!("a#b", ServiceLocator::parse(&l.to_string()).unwrap().group());
    }

    fn field(bytes: &[u8]) -> String {
        bytes.iter().map(|b| ['#', '\\', 'a', ' ', '_'][usize::from(*b % 5)]).collect()
    }

    type Raw = (Vec<u8>, Vec<u8>, Vec<u8>);

    #[quickcheck]
    fn distinct_triples_have_distinct_canonical_forms(a: Raw, b: Raw) -> bool {
        let triple = |(g, s, v): Raw| (field(&g), field(&s), field(&v));
        let norm = |t: &(String, String, String)| {
            (normalize(&t.0).to_owned(), t.1.trim().to_owned(), normalize(&t.2).to_owned())
        };
        let (a, b) = (triple(a), triple(b));

        (norm(&a) == norm(&b)) == (gsv(&a.0, &a.1, &a.2) == gsv(&b.0, &b.1, &b.2))
    }

    #[test]
    fn parse_accepts_all_forms() {
        let a = ServiceLocator::parse("g#S#v").unwrap();
        let b = ServiceLocator::parse("g:S:v").unwrap();
        let c = ServiceLocator::parse("S").unwrap();

        assert_eq!(a, b);
        assert_eq!(c, ServiceLocator::new("", "S", ""));
        assert!(ServiceLocator::parse("g::v").is_none());
        assert!(ServiceLocator::parse("a:b:c:d").is_none());
    }

    #[test]
    fn with_version_rehashes() {
        let l = ServiceLocator::new("g", "S", "1.0");
        let canary = l.with_version("2.0");

        assert_eq!(canary.group(), "g");
        assert_eq!(canary.id(), locator_id("g", "S", "2.0"));
        assert_ne!(canary, l);
    }

    #[quickcheck]
    fn locator_id_is_deterministic(g: String, s: String, v: String) -> bool {
        let a = ServiceLocator::new(&g, &s, &v);
        let b = ServiceLocator::new(&g, &s, &v);

        a.id() == b.id() && a.id() == locator_id(&g, &s, &v)
    }

    #[quickcheck]
    fn proto_conversion_preserves_identity(g: String, s: String, v: String) -> bool {
        let l = ServiceLocator::new(&g, &s, &v);
        let p = proto::Locator::from(&l);

        ServiceLocator::from(&p) == l
    }
}
