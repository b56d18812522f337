// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Canary traffic shifting.
use super::{FilterContext, RouteFilter};
use log::trace;
use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering::Relaxed},
};

/// Shifts a percentage of calls for some services to a canary version.
///
/// Bucketing is a deterministic round-robin over a window of 100 calls, not a random draw:
/// the `n`th decision goes to the canary iff `n % 100 < percentage`, where `n` counts up
/// from a configurable start. The counter is atomic, so concurrent calls never share or
/// skip a bucket.
///
/// Traffic is only shifted when the canary version has at least one live route.
pub struct CanaryFilter {
    services: HashSet<String>,
    version: String,
    percentage: u8,
    counter: AtomicU64,
}

impl CanaryFilter {
    /// Shift `percentage`% of calls for `services` to `version`.
    ///
    /// # Panics
    /// Panics if `percentage` is greater than 100.
    pub fn new<I, S>(services: I, version: &str, percentage: u8) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        assert!(percentage <= 100);

        Self {
            services: services.into_iter().map(Into::into).collect(),
            version: version.to_owned(),
            percentage,
            counter: AtomicU64::new(0),
        }
    }

    /// Start counting decisions at `start` rather than 0.
    pub fn starting_at(self, start: u64) -> Self {
        self.counter.store(start, Relaxed);
        self
    }

    /// Returns the canary version.
    pub fn canary_version(&self) -> &str {
        &self.version
    }

    /// Returns the percentage of calls shifted.
    pub fn percentage(&self) -> u8 {
        self.percentage
    }

    /// Take the next bucketing decision.
    fn take_bucket(&self) -> bool {
        let n = self.counter.fetch_add(1, Relaxed);
        n % 100 < u64::from(self.percentage)
    }
}

impl RouteFilter for CanaryFilter {
    fn name(&self) -> &str {
        "canary"
    }

    fn should_filter(&self, ctx: &FilterContext) -> bool {
        self.services.contains(ctx.service())
            && ctx.version() != self.version
            && (ctx.registry()).contains(&ctx.locator().with_version(&self.version))
    }

    fn apply(&self, ctx: &mut FilterContext) {
        if self.take_bucket() {
            trace!("{} -> canary {}", ctx.locator(), self.version);
            ctx.set_version(&self.version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        locator::ServiceLocator,
        registry::{ServiceRegistry, ServiceRoute},
    };
    use quickcheck_macros::quickcheck;
    use std::sync::Arc;

    fn registry_with(versions: &[&str]) -> Arc<ServiceRegistry> {
        let reg = Arc::new(ServiceRegistry::new());
        for (i, v) in versions.iter().enumerate() {
            let id = format!("app-{}", i);
            let route = ServiceRoute::new(id.as_str(), &id, "n1");
            reg.register_local(&ServiceLocator::new("g", "Orders", v), route);
        }
        reg
    }

    fn ctx(reg: &Arc<ServiceRegistry>, service: &str, version: &str) -> FilterContext {
        FilterContext::new(&ServiceLocator::new("g", service, version), Arc::clone(reg))
    }

    #[test]
    fn thirty_percent_of_a_hundred_calls() {
        let reg = registry_with(&["1", "2"]);
        let f = CanaryFilter::new(vec!["Orders"], "2", 30);

        let shifted: Vec<usize> = (0..100)
            .filter(|_| {
                let mut c = ctx(&reg, "Orders", "1");
                assert!(f.should_filter(&c));
                f.apply(&mut c);
                c.version() == "2"
            })
            .collect();

        assert_eq!(shifted, (0..30).collect::<Vec<_>>());
    }

    #[quickcheck]
    fn bucketing_follows_the_counter(start: u64, p: u8) -> bool {
        let p = p % 101;
        let f = CanaryFilter::new(vec!["Orders"], "2", p).starting_at(start);

        (0..200u64).all(|i| {
            let n = start.wrapping_add(i);
            f.take_bucket() == (n % 100 < u64::from(p))
        })
    }

    #[test]
    fn never_shifts_to_a_version_without_routes() {
        let reg = registry_with(&["1"]);
        let f = CanaryFilter::new(vec!["Orders"], "2", 100);

        assert!(!f.should_filter(&ctx(&reg, "Orders", "1")));
    }

    #[test]
    fn only_targeted_services_are_shifted() {
        let reg = registry_with(&["1", "2"]);
        let f = CanaryFilter::new(vec!["Billing"], "2", 100);

        assert!(!f.should_filter(&ctx(&reg, "Orders", "1")));
    }

    #[test]
    fn calls_already_on_the_canary_are_left_alone() {
        let reg = registry_with(&["1", "2"]);
        let f = CanaryFilter::new(vec!["Orders"], "2", 100);

        assert!(!f.should_filter(&ctx(&reg, "Orders", "2")));
    }

    #[test]
    fn percentage_bounds() {
        let zero = CanaryFilter::new(vec!["Orders"], "2", 0);
        assert!((0..100).all(|_| !zero.take_bucket()));

        let all = CanaryFilter::new(vec!["Orders"], "2", 100);
        assert!((0..100).all(|_| all.take_bucket()));
    }

    #[test]
    #[should_panic]
    fn percentages_over_100_are_rejected() {
        CanaryFilter::new(vec!["Orders"], "2", 101);
    }
}
