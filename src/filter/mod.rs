// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Request-time routing filters.
//!
//! A [FilterChain] runs before an endpoint is selected for a call, and may rewrite where
//! the call goes. Filters are consulted in the order they were added; the first one whose
//! [should_filter](RouteFilter::should_filter) returns true is applied, and the chain
//! stops there. Two filters that both rewrite the version field can't interfere as long
//! as their order is chosen deliberately.
pub mod canary;

pub use canary::CanaryFilter;

use crate::{external::Principal, locator::ServiceLocator, registry::ServiceRegistry};
use std::sync::Arc;

/// Mutable routing state for a single call.
pub struct FilterContext {
    group: String,
    service: String,
    version: String,
    registry: Arc<ServiceRegistry>,
    principal: Option<Principal>,
}

impl FilterContext {
    /// Create a context for a call addressed to `locator`.
    pub fn new(locator: &ServiceLocator, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            group: locator.group().to_owned(),
            service: locator.service().to_owned(),
            version: locator.version().to_owned(),
            registry,
            principal: None,
        }
    }

    /// Attach the authenticated caller.
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Returns the group.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Returns the service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the (possibly rewritten) version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Rewrite the version the call is routed to.
    pub fn set_version(&mut self, version: &str) {
        self.version = version.to_owned();
    }

    /// Returns the locator the call is currently addressed to.
    pub fn locator(&self) -> ServiceLocator {
        ServiceLocator::new(&self.group, &self.service, &self.version)
    }

    /// Returns the registry, for existence checks.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Returns the authenticated caller, if any.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }
}

/// A routing filter.
pub trait RouteFilter: Send + Sync + 'static {
    /// Returns a short name for logs.
    fn name(&self) -> &str;

    /// Returns true if this filter applies to the call.
    fn should_filter(&self, ctx: &FilterContext) -> bool;

    /// Apply this filter to the call.
    fn apply(&self, ctx: &mut FilterContext);
}

/// An ordered list of filters.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn RouteFilter>>,
}

impl FilterChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter. It runs after every filter added before it.
    pub fn with<F: RouteFilter>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Returns the number of filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns true if there are no filters.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the chain over `ctx`. Returns the name of the filter that was applied.
    pub fn run(&self, ctx: &mut FilterContext) -> Option<&str> {
        let f = self.filters.iter().find(|f| f.should_filter(ctx))?;
        f.apply(ctx);
        Some(f.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pin(&'static str, &'static str);

    impl RouteFilter for Pin {
        fn name(&self) -> &str {
            self.0
        }

        fn should_filter(&self, ctx: &FilterContext) -> bool {
            ctx.service() == "Orders"
        }

        fn apply(&self, ctx: &mut FilterContext) {
            ctx.set_version(self.1);
        }
    }

    struct Never;

    impl RouteFilter for Never {
        fn name(&self) -> &str {
            "never"
        }

        fn should_filter(&self, _: &FilterContext) -> bool {
            false
        }

        fn apply(&self, _: &mut FilterContext) {
            unreachable!()
        }
    }

    fn ctx(service: &str) -> FilterContext {
        let l = ServiceLocator::new("g", service, "1");
        FilterContext::new(&l, Arc::new(ServiceRegistry::new()))
    }

    #[test]
    fn first_matching_filter_wins() {
        let chain = FilterChain::new()
            .with(Never)
            .with(Pin("first", "2"))
            .with(Pin("second", "3"));

        let mut c = ctx("Orders");
        assert_eq!(Some("first"), chain.run(&mut c));
        assert_eq!("2", c.version());
        assert_eq!(c.locator(), ServiceLocator::new("g", "Orders", "2"));
    }

    #[test]
    fn unmatched_calls_are_untouched() {
        let chain = FilterChain::new().with(Pin("pin", "2"));

        let mut c = ctx("Billing");
        assert_eq!(None, chain.run(&mut c));
        assert_eq!("1", c.version());
        assert!(c.principal().is_none());
    }
}
