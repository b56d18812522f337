// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The service registry.
//!
//! A table of every known [ServiceLocator] and the [routes](ServiceRoute) that can serve
//! it. Each locator is its own entry with its own writer; readers clone the locator's
//! immutable route list and never see a partial update. App-wide operations touch each
//! locator in turn, and are not atomic across locators.
//!
//! Routes of apps that are out of service are held aside, per app, until the app serves
//! again. Lock order is parked apps before locators.
use crate::{
    cluster::{proto, NodeId},
    event::{ConsumerError, Envelope, Event, EventConsumer, TypeMatcher},
    locator::ServiceLocator,
};
use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use fnv::FnvBuildHasher;
use log::{debug, info};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

/// Upper bound on a route's load balancing weight.
pub const MAX_WEIGHT: u32 = 100;

/// Identifies an endpoint: the app instance a route points at.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(Arc<str>);

impl EndpointId {
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

/// One resolvable target for a locator.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceRoute {
    id: EndpointId,
    app_id: Arc<str>,
    app_name: Arc<str>,
    node_id: NodeId,
    weight: u32,
    tags: Arc<BTreeMap<String, String>>,
}

impl ServiceRoute {
    /// Create a route to the endpoint `id`, owned by app `app_id`, attached to the broker
    /// `node_id`. The app name defaults to the app id, and the weight to 1.
    pub fn new<I, N>(id: I, app_id: &str, node_id: N) -> Self
    where
        I: Into<EndpointId>,
        N: Into<NodeId>,
    {
        Self {
            id: id.into(),
            app_id: app_id.into(),
            app_name: app_id.into(),
            node_id: node_id.into(),
            weight: 1,
            tags: Default::default(),
        }
    }

    /// Set the app name.
    pub fn app_name(mut self, name: &str) -> Self {
        self.app_name = name.into();
        self
    }

    /// Set the load balancing weight, clamped to `1..=MAX_WEIGHT`.
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight.clamp(1, MAX_WEIGHT);
        self
    }

    /// Add an advertised tag.
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        Arc::make_mut(&mut self.tags).insert(key.to_owned(), value.to_owned());
        self
    }

    /// Returns the endpoint id. Routes are unique by this within a locator.
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Returns the id of the owning app instance.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Returns the name of the owning app.
    pub fn name(&self) -> &str {
        &self.app_name
    }

    /// Returns the broker the owning app is attached to.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Returns the load balancing weight.
    pub fn load_weight(&self) -> u32 {
        self.weight
    }

    /// Returns the advertised tags.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }
}

impl From<&proto::ServiceExposed> for ServiceRoute {
    fn from(m: &proto::ServiceExposed) -> Self {
        let mut r = Self::new(m.app_id.as_str(), &m.app_id, m.node_id.as_str()).weight(m.weight);
        if !m.app_name.is_empty() {
            r = r.app_name(&m.app_name);
        }
        r.tags = Arc::new(m.tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        r
    }
}

type Located = (ServiceLocator, ServiceRoute);

struct Slot {
    locator: ServiceLocator,
    routes: Arc<[ServiceRoute]>,
}

impl Slot {
    fn new(locator: &ServiceLocator) -> Self {
        Self {
            locator: locator.clone(),
            routes: Arc::new([]),
        }
    }

    /// Insert or replace `route`. Returns false if an identical route was present.
    fn upsert(&mut self, route: ServiceRoute) -> bool {
        let mut routes = self.routes.to_vec();
        match routes.iter_mut().find(|r| r.id == route.id) {
            Some(r) if *r == route => return false,
            Some(r) => *r = route,
            None => routes.push(route),
        }

        self.routes = routes.into();
        true
    }

    /// Remove routes matching `pred`, pushing them onto `out`.
    fn split<F>(&mut self, pred: F, out: &mut Vec<Located>)
    where F: Fn(&ServiceLocator, &ServiceRoute) -> bool {
        if !self.routes.iter().any(|r| pred(&self.locator, r)) {
            return;
        }

        let (gone, kept): (Vec<_>, Vec<_>) =
            self.routes.iter().cloned().partition(|r| pred(&self.locator, r));
        out.extend(gone.into_iter().map(|r| (self.locator.clone(), r)));
        self.routes = kept.into();
    }
}

fn upsert_parked(parked: &mut Vec<Located>, locator: &ServiceLocator, route: ServiceRoute) -> bool {
    let lid = locator.id();
    match parked.iter_mut().find(|(l, r)| l.id() == lid && r.id == route.id) {
        Some((_, r)) if *r == route => false,
        Some((_, r)) => {
            *r = route;
            true
        }
        None => {
            parked.push((locator.clone(), route));
            true
        }
    }
}

/// The table of known services.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<u64, Slot, FnvBuildHasher>,
    parked: DashMap<Arc<str>, Vec<Located>, FnvBuildHasher>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_live(&self, locator: &ServiceLocator, route: ServiceRoute) -> bool {
        (self.services.entry(locator.id()))
            .or_insert_with(|| Slot::new(locator))
            .upsert(route)
    }

    /// Remove live routes matching `pred` from every locator, dropping emptied locators.
    fn remove_where<F>(&self, pred: F) -> Vec<Located>
    where F: Fn(&ServiceLocator, &ServiceRoute) -> bool {
        let mut removed = Vec::new();
        self.services.retain(|_, s| {
            s.split(&pred, &mut removed);
            !s.routes.is_empty()
        });
        removed
    }

    /// Register `route` under `locator`.
    ///
    /// Registering an identical route twice is a no-op; registering a route whose id is
    /// already present replaces it. If the route's app is out of service, the route is held
    /// aside until the app is [restored](Self::restore_app). Returns true if the registry
    /// changed.
    pub fn register_local(&self, locator: &ServiceLocator, route: ServiceRoute) -> bool {
        let id = route.id.clone();

        let changed = match self.parked.entry(Arc::clone(&route.app_id)) {
            MapEntry::Occupied(mut parked) => {
                let changed = upsert_parked(parked.get_mut(), locator, route);
                if changed {
                    debug!("holding {} for {} until its app serves", id, locator);
                }
                return changed;
            }
            // the vacant entry keeps the app from being parked until the route is live.
            MapEntry::Vacant(_unparked) => self.insert_live(locator, route),
        };

        if changed {
            debug!("registered {} for {}", id, locator);
        }
        changed
    }

    /// Remove the route `id` from `locator`, live or parked. Returns true if it was present.
    pub fn unregister_local(&self, locator: &ServiceLocator, id: &EndpointId) -> bool {
        let lid = locator.id();
        let mut removed = Vec::new();

        if let MapEntry::Occupied(mut slot) = self.services.entry(lid) {
            slot.get_mut().split(|_, r| r.id == *id, &mut removed);
            if slot.get().routes.is_empty() {
                slot.remove();
            }
        }

        let mut unparked = 0;
        for mut parked in self.parked.iter_mut() {
            let before = parked.len();
            parked.retain(|(l, r)| l.id() != lid || r.id != *id);
            unparked += before - parked.len();
        }

        !removed.is_empty() || unparked > 0
    }

    /// Returns every route for `locator`. Unknown locators have no routes.
    pub fn lookup(&self, locator: &ServiceLocator) -> Arc<[ServiceRoute]> {
        self.lookup_id(locator.id())
    }

    /// Returns every route for the locator with id `id`.
    pub fn lookup_id(&self, id: u64) -> Arc<[ServiceRoute]> {
        (self.services.get(&id))
            .map(|s| Arc::clone(&s.routes))
            .unwrap_or_else(|| Arc::new([]))
    }

    /// Returns true if `locator` has at least one route.
    pub fn contains(&self, locator: &ServiceLocator) -> bool {
        self.services.contains_key(&locator.id())
    }

    /// Returns a snapshot of every locator with at least one route.
    pub fn all_services(&self) -> Vec<ServiceLocator> {
        let mut all: Vec<_> = self.services.iter().map(|s| s.locator.clone()).collect();
        all.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        all
    }

    /// Returns the distinct names of apps with at least one route.
    pub fn app_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for s in self.services.iter() {
            names.extend(s.routes.iter().map(|r| Arc::clone(&r.app_name)));
        }
        names.into_iter().map(|n| n.to_string()).collect()
    }

    /// Returns every (locator, route) pair belonging to apps named `app_name`.
    pub fn routes_for_app(&self, app_name: &str) -> Vec<Located> {
        let mut routes = Vec::new();
        for s in self.services.iter() {
            routes.extend(
                (s.routes.iter())
                    .filter(|r| &*r.app_name == app_name)
                    .map(|r| (s.locator.clone(), r.clone())),
            );
        }
        routes
    }

    /// Remove every route (live or parked) owned by app instance `app_id`. Returns the live
    /// routes that were removed.
    pub fn unregister_app(&self, app_id: &str) -> Vec<Located> {
        self.parked.remove(app_id);
        let removed = self.remove_where(|_, r| &*r.app_id == app_id);
        if !removed.is_empty() {
            info!("unregistered {} routes of app {}", removed.len(), app_id);
        }
        removed
    }

    /// Take the routes of `app_id` out of service, keeping them to
    /// [restore](Self::restore_app) later. Routes registered while the app is parked are
    /// kept aside as well. Returns the routes taken out of service.
    pub fn park_app(&self, app_id: &str) -> Vec<Located> {
        let mut parked = self.parked.entry(app_id.into()).or_default();
        let removed = self.remove_where(|_, r| &*r.app_id == app_id);
        for (l, r) in removed.iter() {
            upsert_parked(&mut parked, l, r.clone());
        }
        removed
    }

    /// Put routes parked by [park_app](Self::park_app) back into service. Returns the
    /// restored routes.
    pub fn restore_app(&self, app_id: &str) -> Vec<Located> {
        match self.parked.entry(app_id.into()) {
            MapEntry::Occupied(parked) => {
                for (l, r) in parked.get().iter() {
                    self.insert_live(l, r.clone());
                }
                parked.remove()
            }
            MapEntry::Vacant(_) => Vec::new(),
        }
    }

    /// Returns true if `app_id` is parked.
    pub fn is_parked(&self, app_id: &str) -> bool {
        self.parked.contains_key(app_id)
    }

    /// Remove every route attached to broker `node`.
    pub fn unregister_node(&self, node: &NodeId) -> Vec<Located> {
        self.parked.retain(|_, routes| {
            let before = routes.len();
            routes.retain(|(_, r)| r.node_id != *node);
            routes.len() == before || !routes.is_empty()
        });

        let removed = self.remove_where(|_, r| r.node_id == *node);
        if !removed.is_empty() {
            info!("unregistered {} routes attached to {}", removed.len(), node);
        }
        removed
    }
}

/// Keeps a [ServiceRegistry] consistent with service and app lifecycle events.
pub struct RegistryConsumer {
    registry: Arc<ServiceRegistry>,
}

impl RegistryConsumer {
    /// Apply events to `registry`.
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    const TYPES: TypeMatcher = TypeMatcher::OneOf(&[
        Event::SERVICE_EXPOSED,
        Event::SERVICE_RETRACTED,
        Event::APP_STATUS,
    ]);
}

#[crate::async_trait]
impl EventConsumer for RegistryConsumer {
    fn accepts(&self, ty: &str) -> bool {
        Self::TYPES.matches(ty)
    }

    async fn handle(&self, env: &Envelope) -> Result<(), ConsumerError> {
        match Event::decode(env)? {
            Some(Event::ServiceExposed(m)) => {
                let route = ServiceRoute::from(&m);
                for l in m.locators.iter() {
                    self.registry.register_local(&ServiceLocator::from(l), route.clone());
                }
            }

            Some(Event::ServiceRetracted(m)) if m.locators.is_empty() => {
                self.registry.unregister_app(&m.app_id);
            }

            Some(Event::ServiceRetracted(m)) => {
                let id = EndpointId::from(m.app_id.as_str());
                for l in m.locators.iter() {
                    self.registry.unregister_local(&ServiceLocator::from(l), &id);
                }
            }

            Some(Event::AppStatusChanged(m)) => match m.status() {
                proto::AppStatus::Stopped => {
                    self.registry.unregister_app(&m.app_id);
                }
                proto::AppStatus::OutOfService => {
                    self.registry.park_app(&m.app_id);
                }
                proto::AppStatus::Serving => {
                    self.registry.restore_app(&m.app_id);
                }
                proto::AppStatus::Connected => {}
            },

            _ => {}
        }

        Ok(())
    }
}
