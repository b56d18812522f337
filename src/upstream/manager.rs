// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Keeps upstream pools in sync with the endpoints that serve them.
use super::{
    Backoff, Connector, DestinationKey, Endpoint, EndpointError, NoAvailableEndpoint, Phase,
    RouteError, UpstreamCluster, UpstreamConfig,
};
use crate::{
    cluster::{proto, NodeId},
    event::{ConsumerError, Envelope, Event, EventConsumer, TypeMatcher},
    filter::{FilterChain, FilterContext},
    locator::ServiceLocator,
    metrics::Metrics,
    registry::{EndpointId, ServiceRegistry, ServiceRoute},
};
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use log::{debug, info, trace, warn};
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::Instant,
};
use tokio::{task::JoinHandle, time};

/// Everything known about one endpoint id.
#[derive(Default)]
struct Attachment {
    /// How to reconnect. Resident endpoints have no route.
    route: Option<ServiceRoute>,
    /// Pools the endpoint belongs to, with its weight in each.
    keys: BTreeMap<DestinationKey, u32>,
    /// The last endpoint that was connected.
    endpoint: Option<Arc<dyn Endpoint>>,
    /// Out of service: known, but kept out of every pool.
    parked: bool,
}

/// Owns every [UpstreamCluster], and the endpoints that belong to them.
///
/// Endpoints are tracked by id across all the pools they joined, so a failure observed
/// through one destination removes the endpoint from all of them. Failed endpoints that
/// came from a [ServiceRoute] are reconnected in the background with exponential backoff,
/// until they come back, run out of attempts, or are retracted.
///
/// While a failed endpoint is down, its app's routes are parked in the registry. They are
/// restored when it reconnects, and unregistered if reconnecting gives up.
pub struct UpstreamManager {
    cfg: UpstreamConfig,
    pools: DashMap<DestinationKey, Arc<UpstreamCluster>>,
    attachments: DashMap<EndpointId, Attachment>,
    reconnects: DashMap<EndpointId, JoinHandle<()>>,
    connector: Arc<dyn Connector>,
    registry: Arc<ServiceRegistry>,
    filters: FilterChain,
    metrics: Arc<Metrics>,
}

impl UpstreamManager {
    /// Create a manager.
    ///
    /// # Panics
    /// Panics if `cfg` is invalid.
    pub fn new(
        cfg: UpstreamConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<ServiceRegistry>,
        filters: FilterChain,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        cfg.validate();

        Arc::new(Self {
            cfg,
            pools: DashMap::new(),
            attachments: DashMap::new(),
            reconnects: DashMap::new(),
            connector,
            registry,
            filters,
            metrics,
        })
    }

    /// Returns a fresh routing context for a call addressed to `locator`.
    pub fn context(&self, locator: &ServiceLocator) -> FilterContext {
        FilterContext::new(locator, Arc::clone(&self.registry))
    }

    /// Returns the pool for `key`, if one exists.
    pub fn pool(&self, key: &DestinationKey) -> Option<Arc<UpstreamCluster>> {
        self.pools.get(key).map(|p| Arc::clone(p.value()))
    }

    /// Returns the number of pools, in any phase short of removed.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Returns the number of endpoints waiting to be reconnected.
    pub fn pending_reconnects(&self) -> usize {
        self.reconnects.len()
    }

    fn pool_or_create(&self, key: &DestinationKey) -> Arc<UpstreamCluster> {
        let entry = (self.pools.entry(key.clone()))
            .or_insert_with(|| Arc::new(UpstreamCluster::new(key.clone())));
        Arc::clone(entry.value())
    }

    fn add_to_pool(&self, key: &DestinationKey, endpoint: &Arc<dyn Endpoint>, weight: u32) {
        loop {
            let pool = self.pool_or_create(key);
            if pool.add(Arc::clone(endpoint), weight) {
                return;
            }
            // reaped between the lookup and the add; replace it.
            self.pools.remove_if(key, |_, p| Arc::ptr_eq(p, &pool));
        }
    }

    /// Select the next endpoint for `key`.
    pub fn select(&self, key: &DestinationKey) -> Result<Arc<dyn Endpoint>, NoAvailableEndpoint> {
        let selected = match self.pool(key) {
            Some(pool) => pool.select(),
            None => Err(NoAvailableEndpoint(key.clone())),
        };

        if selected.is_err() {
            self.metrics.no_endpoint();
        }
        selected
    }

    /// Add `endpoint` to the pool for `key` with `weight`.
    pub fn on_endpoint_added(&self, key: DestinationKey, endpoint: Arc<dyn Endpoint>, weight: u32) {
        let parked = {
            let mut a = self.attachments.entry(endpoint.id().clone()).or_default();
            a.keys.insert(key.clone(), weight);
            a.endpoint = Some(Arc::clone(&endpoint));
            a.parked
        };

        if !parked {
            self.add_to_pool(&key, &endpoint, weight);
        }
    }

    /// Remove the endpoint `id` from the pool for `key`. Returns true if it was present.
    ///
    /// An endpoint that no longer belongs to any pool is forgotten, and any pending
    /// reconnect is cancelled.
    pub fn on_endpoint_removed(&self, key: &DestinationKey, id: &EndpointId) -> bool {
        let removed = self.pool(key).map_or(false, |p| p.remove(id));

        if let Some(mut a) = self.attachments.get_mut(id) {
            a.keys.remove(key);
        }
        if (self.attachments.remove_if(id, |_, a| a.keys.is_empty())).is_some() {
            self.cancel_reconnect(id);
        }

        removed
    }

    /// Remove the endpoint `id` from every pool and forget it. Returns the number of pools
    /// it was removed from.
    pub fn retract(&self, id: &EndpointId) -> usize {
        let attachment = self.attachments.remove(id);
        self.cancel_reconnect(id);

        let keys = match attachment {
            Some((_, a)) => a.keys,
            None => return 0,
        };

        let n = (keys.keys())
            .filter(|k| self.pool(k).map_or(false, |p| p.remove(id)))
            .count();

        debug!("retracted {} from {} pools", id, n);
        n
    }

    /// Take the endpoint `id` out of every pool, remembering where it belongs. Returns
    /// false if the endpoint is unknown.
    pub fn park(&self, id: &EndpointId) -> bool {
        let keys: Vec<_> = match self.attachments.get_mut(id) {
            Some(mut a) => {
                a.parked = true;
                a.keys.keys().cloned().collect()
            }
            None => return false,
        };

        for k in keys.iter() {
            if let Some(p) = self.pool(k) {
                p.remove(id);
            }
        }
        true
    }

    /// Put an endpoint parked by [park](Self::park) back into its pools. If it died in the
    /// meantime, a reconnect is scheduled instead.
    pub fn unpark(self: &Arc<Self>, id: &EndpointId) -> bool {
        let (endpoint, route, keys) = match self.attachments.get_mut(id) {
            Some(mut a) => {
                a.parked = false;
                (a.endpoint.clone(), a.route.clone(), a.keys.clone())
            }
            None => return false,
        };

        match (endpoint.filter(|e| e.is_alive()), route) {
            (Some(ep), _) => {
                for (k, w) in keys {
                    self.add_to_pool(&k, &ep, w);
                }
            }
            (None, Some(route)) => {
                self.registry.park_app(route.app_id());
                self.schedule_reconnect(route);
            }
            (None, None) => {}
        }
        true
    }

    /// Report that the endpoint `id` is dead.
    ///
    /// It's removed from every pool it joined, and if it came from a route, a reconnect is
    /// scheduled. The pools themselves survive, and may drain.
    pub fn on_endpoint_failed(self: &Arc<Self>, id: &EndpointId) {
        let (route, keys): (_, Vec<_>) = match self.attachments.get_mut(id) {
            Some(mut a) => {
                a.endpoint = None;
                (a.route.clone(), a.keys.keys().cloned().collect())
            }
            None => return,
        };

        for k in keys.iter() {
            if let Some(p) = self.pool(k) {
                p.remove(id);
            }
        }

        warn!("endpoint {} failed", id);
        match route {
            Some(route) => {
                self.registry.park_app(route.app_id());
                self.schedule_reconnect(route);
            }
            None => debug!("{} is resident, not reconnecting", id),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, route: ServiceRoute) {
        if let Entry::Vacant(v) = self.reconnects.entry(route.id().clone()) {
            let task = reconnect(Arc::downgrade(self), route, self.cfg.reconnect);
            v.insert(tokio::spawn(task));
        }
    }

    fn cancel_reconnect(&self, id: &EndpointId) {
        if let Some((_, task)) = self.reconnects.remove(id) {
            debug!("cancelled reconnect of {}", id);
            task.abort();
        }
    }

    /// Put a freshly connected endpoint into every pool its id belongs to, and its app's
    /// routes back into the registry.
    fn reattach(&self, endpoint: Arc<dyn Endpoint>) {
        let (keys, app_id, parked) = match self.attachments.get_mut(endpoint.id()) {
            Some(mut a) => {
                a.endpoint = Some(Arc::clone(&endpoint));
                let app_id = a.route.as_ref().map(|r| r.app_id().to_owned());
                (a.keys.clone(), app_id, a.parked)
            }
            None => return,
        };

        if parked {
            return;
        }
        for (k, w) in keys {
            self.add_to_pool(&k, &endpoint, w);
        }
        if let Some(app_id) = app_id {
            self.registry.restore_app(&app_id);
        }
    }

    /// Forget an endpoint that couldn't be reconnected, along with its app's routes.
    fn abandon(&self, route: &ServiceRoute) {
        let alive = (self.attachments.get(route.id()))
            .and_then(|a| a.endpoint.clone())
            .map_or(false, |e| e.is_alive());
        if alive {
            return;
        }

        self.retract(route.id());
        let routes = self.registry.unregister_app(route.app_id());
        info!("abandoned {}, dropping {} routes", route.id(), routes.len());
    }

    /// Connect to the endpoint behind `route`, and add it to the pools for `keys`.
    ///
    /// If the endpoint is already connected, it only joins the new pools. If connecting
    /// fails, a reconnect is scheduled and the error is returned.
    pub async fn connect_route<I>(self: &Arc<Self>, route: ServiceRoute, keys: I) -> Result<(), EndpointError>
    where I: IntoIterator<Item = DestinationKey> {
        let id = route.id().clone();
        let weight = route.load_weight();

        let live = {
            let mut a = self.attachments.entry(id.clone()).or_default();
            a.route = Some(route.clone());
            a.keys.extend(keys.into_iter().map(|k| (k, weight)));
            a.endpoint.clone().filter(|e| e.is_alive())
        };

        if let Some(ep) = live {
            self.reattach(ep);
            return Ok(());
        }

        let connected = self.connector.connect(&route).await.and_then(|ep| {
            if *ep.id() == id {
                Ok(ep)
            } else {
                Err(EndpointError::Connect(format!("connected to {} for route {}", ep.id(), id)))
            }
        });

        match connected {
            Ok(ep) => {
                self.cancel_reconnect(&id);
                self.reattach(ep);
                info!("connected {} ({})", id, route.name());
                Ok(())
            }
            Err(e) => {
                warn!("connecting {} failed: {}", id, e);
                self.schedule_reconnect(route);
                Err(e)
            }
        }
    }

    /// Resolve the endpoint a call should go to.
    ///
    /// The filter chain runs first, and may rewrite the destination. If the rewritten
    /// destination has no live endpoint, the call falls back to where it was originally
    /// addressed. Dead endpoints found during selection are reported as failed and
    /// skipped.
    pub fn route(self: &Arc<Self>, ctx: &mut FilterContext) -> Result<Arc<dyn Endpoint>, NoAvailableEndpoint> {
        let original = ctx.locator();
        if let Some(name) = self.filters.run(ctx) {
            trace!("{} applied to {}", name, original);
        }

        let target = ctx.locator();
        if target != original {
            match self.select_live(&DestinationKey::from(&target)) {
                Ok(ep) => return Ok(ep),
                Err(_) => {
                    debug!("{} has no endpoint, falling back to {}", target, original);
                    ctx.set_version(original.version());
                }
            }
        }

        let selected = self.select_live(&DestinationKey::from(&original));
        if selected.is_err() {
            self.metrics.no_endpoint();
        }
        selected
    }

    fn select_live(self: &Arc<Self>, key: &DestinationKey) -> Result<Arc<dyn Endpoint>, NoAvailableEndpoint> {
        let pool = self.pool(key).ok_or_else(|| NoAvailableEndpoint(key.clone()))?;

        for _ in 0..=pool.ring_len() {
            let ep = pool.select()?;
            if ep.is_alive() {
                return Ok(ep);
            }

            self.on_endpoint_failed(ep.id());
            pool.remove(ep.id());
        }

        Err(NoAvailableEndpoint(key.clone()))
    }

    /// Route a call and forward `payload` to the selected endpoint.
    pub async fn call(self: &Arc<Self>, ctx: &mut FilterContext, payload: Bytes) -> Result<Bytes, RouteError> {
        let ep = self.route(ctx)?;
        let id = ep.id().clone();

        match time::timeout(self.cfg.call_timeout, ep.request(payload)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(EndpointError::Closed)) => {
                self.on_endpoint_failed(&id);
                Err(RouteError::Endpoint(id, EndpointError::Closed))
            }
            Ok(Err(e)) => Err(RouteError::Endpoint(id, e)),
            Err(_) => Err(RouteError::Timeout(id)),
        }
    }

    /// Remove drained pools that have been empty for at least the drain grace period as
    /// of `now`, that nobody else holds, and whose destination has no route left in the
    /// registry. Returns the number of pools removed.
    pub fn reap(&self, now: Instant) -> usize {
        let grace = self.cfg.drain_grace;
        let expired: Vec<_> = (self.pools.iter())
            .filter(|p| p.phase() == Phase::Draining)
            .filter(|p| (p.drained_at()).map_or(false, |t| now.saturating_duration_since(t) >= grace))
            .map(|p| p.key().clone())
            .collect();

        let mut reaped = 0;
        for key in expired.into_iter().filter(|k| !self.has_routes(k)) {
            let removed = self.pools.remove_if(&key, |_, p| {
                Arc::strong_count(p) == 1 && p.phase() == Phase::Draining && p.mark_removed()
            });

            if removed.is_some() {
                info!("reaped {}", key);
                reaped += 1;
            }
        }
        reaped
    }

    fn has_routes(&self, key: &DestinationKey) -> bool {
        match key {
            DestinationKey::Service(id) => !self.registry.lookup_id(*id).is_empty(),
            DestinationKey::App(name) => !self.registry.routes_for_app(name).is_empty(),
        }
    }

    /// Retract every endpoint routed through the broker `node`. Returns how many were
    /// retracted.
    pub fn purge_node(&self, node: &NodeId) -> usize {
        let ids: Vec<_> = (self.attachments.iter())
            .filter(|a| a.route.as_ref().map_or(false, |r| r.node_id() == node))
            .map(|a| a.key().clone())
            .collect();

        for id in ids.iter() {
            self.retract(id);
        }
        if !ids.is_empty() {
            info!("purged {} endpoints attached to {}", ids.len(), node);
        }
        ids.len()
    }
}

async fn reconnect(mgr: Weak<UpstreamManager>, route: ServiceRoute, backoff: Backoff) {
    let id = route.id().clone();

    for attempt in 0..backoff.max_attempts {
        time::sleep(backoff.delay(attempt)).await;

        let mgr = match mgr.upgrade() {
            Some(mgr) => mgr,
            None => return,
        };
        if !mgr.attachments.contains_key(&id) {
            mgr.reconnects.remove(&id);
            return;
        }

        mgr.metrics.reconnect_attempted();
        match mgr.connector.connect(&route).await {
            Ok(ep) if *ep.id() == id => {
                info!("reconnected {} after {} attempts", id, attempt + 1);
                // deregister first, so a failure after reattaching schedules anew.
                mgr.reconnects.remove(&id);
                mgr.reattach(ep);
                return;
            }
            Ok(ep) => warn!("reconnect of {} yielded {}", id, ep.id()),
            Err(e) => debug!("reconnect of {} failed (attempt {}): {}", id, attempt + 1, e),
        }
    }

    warn!("giving up on {} after {} attempts", id, backoff.max_attempts);
    if let Some(mgr) = mgr.upgrade() {
        mgr.reconnects.remove(&id);
        mgr.abandon(&route);
    }
}

/// Keeps an [UpstreamManager] consistent with service and app lifecycle events.
///
/// Exposed services are connected and join the pools for their app and each of their
/// locators. Retractions and status changes remove, park or restore them.
pub struct UpstreamConsumer {
    manager: Arc<UpstreamManager>,
}

impl UpstreamConsumer {
    /// Apply events to `manager`.
    pub fn new(manager: Arc<UpstreamManager>) -> Self {
        Self { manager }
    }

    const TYPES: TypeMatcher = TypeMatcher::OneOf(&[
        Event::SERVICE_EXPOSED,
        Event::SERVICE_RETRACTED,
        Event::APP_STATUS,
    ]);
}

#[crate::async_trait]
impl EventConsumer for UpstreamConsumer {
    fn accepts(&self, ty: &str) -> bool {
        Self::TYPES.matches(ty)
    }

    async fn handle(&self, env: &Envelope) -> Result<(), ConsumerError> {
        match Event::decode(env)? {
            Some(Event::ServiceExposed(m)) => {
                let route = ServiceRoute::from(&m);
                let keys = Some(DestinationKey::app(route.name())).into_iter().chain(
                    (m.locators.iter()).map(|l| DestinationKey::from(&ServiceLocator::from(l))),
                );

                (self.manager.connect_route(route, keys).await)
                    .map_err(ConsumerError::failed)?;
            }

            Some(Event::ServiceRetracted(m)) if m.locators.is_empty() => {
                self.manager.retract(&m.app_id.as_str().into());
            }

            Some(Event::ServiceRetracted(m)) => {
                let id = EndpointId::from(m.app_id.as_str());
                for l in m.locators.iter() {
                    let key = DestinationKey::from(&ServiceLocator::from(l));
                    self.manager.on_endpoint_removed(&key, &id);
                }
            }

            Some(Event::AppStatusChanged(m)) => {
                let id = EndpointId::from(m.app_id.as_str());
                match m.status() {
                    proto::AppStatus::Stopped => {
                        self.manager.retract(&id);
                    }
                    proto::AppStatus::OutOfService => {
                        self.manager.park(&id);
                    }
                    proto::AppStatus::Serving => {
                        self.manager.unpark(&id);
                    }
                    proto::AppStatus::Connected => {}
                }
            }

            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::CanaryFilter,
        upstream::pool::tests::{echo, Echo},
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Mutex,
        },
        time::Duration,
    };

    /// Fails the first `fail_first` connects, then hands out echo endpoints.
    #[derive(Default)]
    struct Scripted {
        fail_first: AtomicUsize,
        attempts: AtomicUsize,
        made: Mutex<Vec<Arc<Echo>>>,
    }

    impl Scripted {
        fn failing(n: usize) -> Arc<Self> {
            let s = Self::default();
            s.fail_first.store(n, SeqCst);
            Arc::new(s)
        }

        fn last(&self) -> Arc<Echo> {
            Arc::clone(self.made.lock().unwrap().last().unwrap())
        }
    }

    #[crate::async_trait]
    impl Connector for Scripted {
        async fn connect(&self, route: &ServiceRoute) -> Result<Arc<dyn Endpoint>, EndpointError> {
            self.attempts.fetch_add(1, SeqCst);
            let failed = (self.fail_first)
                .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
                .is_ok();

            if failed {
                return Err(EndpointError::Connect("refused".into()));
            }

            let ep = echo(route.id().as_str());
            self.made.lock().unwrap().push(Arc::clone(&ep));
            Ok(ep)
        }
    }

    fn config() -> UpstreamConfig {
        UpstreamConfig {
            drain_grace: Duration::from_secs(30),
            call_timeout: Duration::from_secs(1),
            reconnect: Backoff {
                base: Duration::from_millis(10),
                max: Duration::from_millis(80),
                max_attempts: 4,
            },
        }
    }

    fn manager_with(
        connector: Arc<Scripted>,
        filters: FilterChain,
    ) -> (Arc<UpstreamManager>, Arc<ServiceRegistry>, Arc<Metrics>) {
        let registry = Arc::new(ServiceRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let mgr = UpstreamManager::new(
            config(),
            connector,
            Arc::clone(&registry),
            filters,
            Arc::clone(&metrics),
        );
        (mgr, registry, metrics)
    }

    fn loc(v: &str) -> ServiceLocator {
        ServiceLocator::new("g", "Orders", v)
    }

    fn route(id: &str) -> ServiceRoute {
        ServiceRoute::new(id, id, "n1").app_name("orders")
    }

    #[test]
    fn unknown_keys_fail_explicitly() {
        let (mgr, _, metrics) = manager_with(Scripted::failing(0), FilterChain::new());
        let key = DestinationKey::app("nope");

        assert_eq!(Err(NoAvailableEndpoint(key.clone())), mgr.select(&key).map(|_| ()));
        assert_eq!(1, metrics.no_endpoint_failures());
    }

    #[test]
    fn one_endpoint_serves_many_keys() {
        let (mgr, _, _) = manager_with(Scripted::failing(0), FilterChain::new());
        let (app, svc) = (DestinationKey::app("orders"), DestinationKey::from(&loc("1")));

        let e = echo("a1");
        mgr.on_endpoint_added(app.clone(), e.clone(), 1);
        mgr.on_endpoint_added(svc.clone(), e, 2);
        assert_eq!(2, mgr.pool(&svc).unwrap().ring_len());

        assert!(mgr.on_endpoint_removed(&svc, &"a1".into()));
        assert!(mgr.select(&app).is_ok());
        assert!(mgr.select(&svc).is_err());

        assert_eq!(1, mgr.retract(&"a1".into()));
        assert!(mgr.select(&app).is_err());
        assert_eq!(0, mgr.retract(&"a1".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_endpoints_are_reconnected() {
        let conn = Scripted::failing(0);
        let (mgr, _, _) = manager_with(Arc::clone(&conn), FilterChain::new());
        let key = DestinationKey::from(&loc("1"));

        mgr.connect_route(route("a1"), vec![key.clone()]).await.unwrap();
        assert!(mgr.select(&key).is_ok());

        // the next two reconnect attempts fail.
        conn.fail_first.store(2, SeqCst);
        mgr.on_endpoint_failed(&"a1".into());
        assert!(mgr.select(&key).is_err());
        assert_eq!(Phase::Draining, mgr.pool(&key).unwrap().phase());
        assert_eq!(1, mgr.pending_reconnects());

        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(4, conn.attempts.load(SeqCst));
        assert_eq!(0, mgr.pending_reconnects());
        assert_eq!(Phase::Active, mgr.pool(&key).unwrap().phase());
        assert!(mgr.select(&key).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_give_up_eventually() {
        let conn = Scripted::failing(usize::MAX);
        let (mgr, registry, metrics) = manager_with(Arc::clone(&conn), FilterChain::new());
        let key = DestinationKey::from(&loc("1"));

        registry.register_local(&loc("1"), route("a1"));
        assert!(mgr.connect_route(route("a1"), vec![key.clone()]).await.is_err());
        assert_eq!(1, mgr.pending_reconnects());

        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(1 + 4, conn.attempts.load(SeqCst));
        assert_eq!(0, mgr.pending_reconnects());
        assert!(metrics.scrape().contains("switchyard_reconnect_attempts_total 4\n"));

        // the endpoint and its routes are forgotten.
        assert!(!registry.contains(&loc("1")));
        assert_eq!(0, mgr.retract(&"a1".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_endpoints_leave_the_registry_until_reconnected() {
        let conn = Scripted::failing(0);
        let (mgr, registry, _) = manager_with(Arc::clone(&conn), FilterChain::new());
        let key = DestinationKey::from(&loc("1"));

        registry.register_local(&loc("1"), route("a1"));
        mgr.connect_route(route("a1"), vec![key.clone()]).await.unwrap();

        conn.fail_first.store(1, SeqCst);
        mgr.on_endpoint_failed(&"a1".into());
        assert!(!registry.contains(&loc("1")));
        assert!(registry.is_parked("a1"));

        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(0, mgr.pending_reconnects());
        assert!(mgr.select(&key).is_ok());
        assert_eq!(1, registry.lookup(&loc("1")).len());
        assert!(!registry.is_parked("a1"));
    }

    #[tokio::test(start_paused = true)]
    async fn retraction_cancels_reconnects() {
        let conn = Scripted::failing(usize::MAX);
        let (mgr, _, _) = manager_with(Arc::clone(&conn), FilterChain::new());

        let _ = mgr.connect_route(route("a1"), vec![DestinationKey::app("orders")]).await;
        assert_eq!(1, mgr.pending_reconnects());

        mgr.retract(&"a1".into());
        assert_eq!(0, mgr.pending_reconnects());

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(1, conn.attempts.load(SeqCst));
    }

    #[tokio::test]
    async fn dead_endpoints_are_skipped_at_selection() {
        let conn = Scripted::failing(0);
        let (mgr, _, _) = manager_with(Arc::clone(&conn), FilterChain::new());
        let key = DestinationKey::from(&loc("1"));

        mgr.connect_route(route("a1"), vec![key.clone()]).await.unwrap();
        let a1 = conn.last();
        mgr.connect_route(route("a2"), vec![key.clone()]).await.unwrap();

        a1.alive.store(false, SeqCst);
        for _ in 0..4 {
            let mut ctx = mgr.context(&loc("1"));
            assert_eq!("a2", mgr.route(&mut ctx).unwrap().id().as_str());
        }
        assert_eq!(vec![EndpointId::from("a2")], mgr.pool(&key).unwrap().endpoints());
    }

    #[tokio::test]
    async fn canary_falls_back_to_the_original_version() {
        let conn = Scripted::failing(0);
        let filters = FilterChain::new().with(CanaryFilter::new(vec!["Orders"], "2", 100));
        let (mgr, registry, _) = manager_with(Arc::clone(&conn), filters);

        registry.register_local(&loc("1"), route("a1"));
        registry.register_local(&loc("2"), route("a2"));
        mgr.connect_route(route("a1"), vec![DestinationKey::from(&loc("1"))]).await.unwrap();
        mgr.connect_route(route("a2"), vec![DestinationKey::from(&loc("2"))]).await.unwrap();

        let mut ctx = mgr.context(&loc("1"));
        assert_eq!("a2", mgr.route(&mut ctx).unwrap().id().as_str());
        assert_eq!("2", ctx.version());

        // the canary is registered, but none of its endpoints are connected.
        mgr.retract(&"a2".into());
        let mut ctx = mgr.context(&loc("1"));
        assert_eq!("a1", mgr.route(&mut ctx).unwrap().id().as_str());
        assert_eq!("1", ctx.version());
    }

    #[tokio::test]
    async fn calls_are_forwarded() {
        let conn = Scripted::failing(0);
        let (mgr, _, _) = manager_with(Arc::clone(&conn), FilterChain::new());
        mgr.connect_route(route("a1"), vec![DestinationKey::from(&loc("1"))]).await.unwrap();

        let mut ctx = mgr.context(&loc("1"));
        let resp = mgr.call(&mut ctx, Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&b"ping"[..], &resp[..]);

        let mut ctx = mgr.context(&loc("9"));
        let err = mgr.call(&mut ctx, Bytes::new()).await.err().unwrap();
        assert!(matches!(err, RouteError::NoAvailableEndpoint(_)));
    }

    #[test]
    fn reaping_honors_grace_holders_and_routes() {
        let (mgr, registry, _) = manager_with(Scripted::failing(0), FilterChain::new());
        let (k1, k2) = (DestinationKey::from(&loc("1")), DestinationKey::from(&loc("2")));

        mgr.on_endpoint_added(k1.clone(), echo("a1"), 1);
        mgr.on_endpoint_added(k2.clone(), echo("a2"), 1);
        mgr.on_endpoint_removed(&k1, &"a1".into());
        mgr.on_endpoint_removed(&k2, &"a2".into());

        // k2 still has a route in the registry.
        registry.register_local(&loc("2"), route("a2"));

        let now = Instant::now();
        assert_eq!(0, mgr.reap(now));

        let later = now + Duration::from_secs(31);
        let held = mgr.pool(&k1).unwrap();
        assert_eq!(0, mgr.reap(later));
        drop(held);

        assert_eq!(1, mgr.reap(later));
        assert!(mgr.pool(&k1).is_none());
        assert!(mgr.pool(&k2).is_some());

        // a new endpoint for a reaped key gets a new pool.
        mgr.on_endpoint_added(k1.clone(), echo("a3"), 1);
        assert_eq!(Phase::Active, mgr.pool(&k1).unwrap().phase());
    }

    #[test]
    fn parked_endpoints_leave_and_rejoin_their_pools() {
        let (mgr, _, _) = manager_with(Scripted::failing(0), FilterChain::new());
        let key = DestinationKey::app("orders");
        mgr.on_endpoint_added(key.clone(), echo("a1"), 1);

        assert!(mgr.park(&"a1".into()));
        assert!(mgr.select(&key).is_err());

        // joining another pool while parked doesn't serve it either.
        let svc = DestinationKey::from(&loc("1"));
        mgr.on_endpoint_added(svc.clone(), echo("a1"), 1);
        assert!(mgr.select(&svc).is_err());

        assert!(mgr.unpark(&"a1".into()));
        assert!(mgr.select(&key).is_ok());
        assert!(mgr.select(&svc).is_ok());
    }

    #[tokio::test]
    async fn node_departure_purges_its_endpoints() {
        let (mgr, _, _) = manager_with(Scripted::failing(0), FilterChain::new());
        let key = DestinationKey::app("orders");

        let remote = ServiceRoute::new("a2", "a2", "n2").app_name("orders");
        mgr.connect_route(route("a1"), vec![key.clone()]).await.unwrap();
        mgr.connect_route(remote, vec![key.clone()]).await.unwrap();

        assert_eq!(1, mgr.purge_node(&"n2".into()));
        assert_eq!(vec![EndpointId::from("a1")], mgr.pool(&key).unwrap().endpoints());
    }

    fn exposed(app: &str, versions: &[&str]) -> Envelope {
        Envelope::from_event(
            "n1",
            &Event::ServiceExposed(proto::ServiceExposed {
                app_id: app.into(),
                app_name: "orders".into(),
                node_id: "n1".into(),
                locators: versions.iter().map(|v| (&loc(v)).into()).collect(),
                weight: 2,
                tags: Default::default(),
            }),
        )
    }

    fn status(app: &str, s: proto::AppStatus) -> Envelope {
        let mut m = proto::AppStatusChanged {
            app_id: app.into(),
            ..Default::default()
        };
        m.set_status(s);
        Envelope::from_event("n1", &Event::AppStatusChanged(m))
    }

    #[tokio::test]
    async fn consumer_follows_app_lifecycle() {
        let (mgr, _, _) = manager_with(Scripted::failing(0), FilterChain::new());
        let c = UpstreamConsumer::new(Arc::clone(&mgr));
        let (app, v1, v2) = (
            DestinationKey::app("orders"),
            DestinationKey::from(&loc("1")),
            DestinationKey::from(&loc("2")),
        );

        c.handle(&exposed("a1", &["1", "2"])).await.unwrap();
        assert_eq!(3, mgr.pool_count());
        assert_eq!(2, mgr.pool(&v1).unwrap().ring_len());

        c.handle(&status("a1", proto::AppStatus::OutOfService)).await.unwrap();
        assert!(mgr.select(&app).is_err());

        c.handle(&status("a1", proto::AppStatus::Serving)).await.unwrap();
        assert!(mgr.select(&app).is_ok());

        let retract = Envelope::from_event(
            "n1",
            &Event::ServiceRetracted(proto::ServiceRetracted {
                app_id: "a1".into(),
                locators: vec![(&loc("2")).into()],
            }),
        );
        c.handle(&retract).await.unwrap();
        assert!(mgr.select(&v1).is_ok());
        assert!(mgr.select(&v2).is_err());

        c.handle(&status("a1", proto::AppStatus::Stopped)).await.unwrap();
        assert!(mgr.select(&app).is_err());
        assert!(mgr.select(&v1).is_err());
    }

    #[tokio::test]
    async fn consumer_reports_connect_failures() {
        let (mgr, _, _) = manager_with(Scripted::failing(1), FilterChain::new());
        let c = UpstreamConsumer::new(Arc::clone(&mgr));

        let err = c.handle(&exposed("a1", &["1"])).await.err().unwrap();
        assert!(matches!(err, ConsumerError::Failed(_)));
        assert_eq!(1, mgr.pending_reconnects());
    }
}
