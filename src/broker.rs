// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Broker assembly.
//!
//! [Broker] collects configuration, filters, health indicators and collaborators, and
//! [builds](Broker::build) a [BrokerNode]: every component wired together, with the event
//! consumers that keep them consistent already subscribed. Serving the node runs the
//! broker-to-broker gRPC channel alongside the background tasks.
use crate::{
    cluster::{
        proto::{
            self,
            broker_link_server::{BrokerLink, BrokerLinkServer},
        },
        BroadcastReport, BrokerInfo, Discovery, DiscoveryMembership, GrpcTransport, Membership,
        MembershipConfig, Standalone, Subscription,
    },
    discovery::DiscoveryBridge,
    event::{Dedup, DeliveryPolicy, Envelope, Event, EventBus},
    external::{
        AuthError, AuthenticationService, CacheForwarder, CacheInvalidator, ConfigForwarder,
        ConfigStore,
    },
    filter::{FilterChain, FilterContext, RouteFilter},
    health::{HealthAggregator, HealthIndicator},
    locator::ServiceLocator,
    metrics::Metrics,
    registry::{RegistryConsumer, ServiceRegistry, ServiceRoute},
    upstream::{Connector, UpstreamConfig, UpstreamConsumer, UpstreamManager},
};
use futures::future::{pending, BoxFuture, FutureExt};
use log::{debug, info, warn};
use std::{
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::{interval, MissedTickBehavior};
use tonic::{
    codegen::http,
    transport::{ClientTlsConfig, Server, ServerTlsConfig},
    Request, Response, Status,
};
use tracing::Span;

/// How often drained upstream pools are considered for reaping.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// An unstarted broker.
///
/// This wraps the grpc server in [tonic::transport], and provides a pass-through
/// implementation for most of its configuration methods.
pub struct Broker {
    local: BrokerInfo,
    grpc: Server,
    connector: Arc<dyn Connector>,
    membership_cfg: MembershipConfig,
    upstream_cfg: UpstreamConfig,
    discovery: Option<Arc<dyn Discovery>>,
    client_tls: Option<ClientTlsConfig>,
    filters: FilterChain,
    health: HealthAggregator,
    auth: Option<Arc<dyn AuthenticationService>>,
    config: Option<(Arc<dyn ConfigStore>, String)>,
    cache: Option<Arc<dyn CacheInvalidator>>,
    dedup_window: Duration,
}

impl Broker {
    /// Create a broker identified by `local`, connecting to app endpoints with
    /// `connector`. Unless [discovery](Self::discovery) is configured, it runs standalone.
    pub fn new<C: Connector>(local: BrokerInfo, connector: C) -> Self {
        Self {
            local,
            grpc: Server::builder(),
            connector: Arc::new(connector),
            membership_cfg: MembershipConfig::new(),
            upstream_cfg: UpstreamConfig::new(),
            discovery: None,
            client_tls: None,
            filters: FilterChain::new(),
            health: HealthAggregator::new(),
            auth: None,
            config: None,
            cache: None,
            dedup_window: Duration::from_secs(60),
        }
    }

    /// Configure cluster membership.
    ///
    /// # Panics
    /// Panics if any invariants (listed at [MembershipConfig]) are not upheld.
    pub fn membership_config(mut self, cfg: MembershipConfig) -> Self {
        cfg.validate();
        self.membership_cfg = cfg;
        self
    }

    /// Configure upstream pools.
    ///
    /// # Panics
    /// Panics if any invariants (listed at [UpstreamConfig]) are not upheld.
    pub fn upstream_config(mut self, cfg: UpstreamConfig) -> Self {
        cfg.validate();
        self.upstream_cfg = cfg;
        self
    }

    /// Pull peer brokers from `discovery`.
    pub fn discovery<D: Discovery>(mut self, discovery: D) -> Self {
        self.discovery = Some(Arc::new(discovery));
        self
    }

    /// Configure TLS for connections to peer brokers.
    pub fn client_tls_config(mut self, tls_config: ClientTlsConfig) -> Self {
        self.client_tls = Some(tls_config);
        self
    }

    /// Append a routing filter. Filters run in the order they were added.
    pub fn add_filter<F: RouteFilter>(mut self, filter: F) -> Self {
        self.filters = self.filters.with(filter);
        self
    }

    /// Add a health indicator that applies to every check.
    pub fn add_indicator<I: HealthIndicator>(mut self, indicator: I) -> Self {
        self.health = self.health.with_indicator(indicator);
        self
    }

    /// Add a health indicator that only applies to checks for `service`.
    pub fn add_service_indicator<I: HealthIndicator>(mut self, service: &str, indicator: I) -> Self {
        self.health = self.health.with_service_indicator(service, indicator);
        self
    }

    /// Authenticate callers with `auth`.
    pub fn authentication<A: AuthenticationService>(mut self, auth: A) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Forward configuration changes into `scope` of `store`.
    pub fn config_store<S: ConfigStore>(mut self, store: S, scope: &str) -> Self {
        self.config = Some((Arc::new(store), scope.to_owned()));
        self
    }

    /// Forward cache invalidations to `cache`.
    pub fn cache_invalidator<I: CacheInvalidator>(mut self, cache: I) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Set how long envelope ids are remembered to drop redeliveries.
    ///
    /// Defaults to 60s.
    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }
}

/// Methods that pass-through to [tonic::transport].
impl Broker {
    /// Configure TLS for this server.
    pub fn server_tls_config(mut self, tls_config: ServerTlsConfig) -> Result<Self, tonic::transport::Error> {
        self.grpc = self.grpc.tls_config(tls_config)?;
        Ok(self)
    }

    /// Set the concurrency limit applied to on requests inbound per connection.
    pub fn concurrency_limit_per_connection(mut self, limit: usize) -> Self {
        self.grpc = self.grpc.concurrency_limit_per_connection(limit);
        self
    }

    /// Set a timeout for all request handlers.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.grpc = self.grpc.timeout(timeout);
        self
    }

    /// Set whether TCP keepalive messages are enabled on accepted connections.
    ///
    /// Defaults to no keepalive (None).
    pub fn tcp_keepalive<D: Into<Option<Duration>>>(mut self, tcp_keepalive: D) -> Self {
        self.grpc = self.grpc.tcp_keepalive(tcp_keepalive.into());
        self
    }

    /// Set the value of TCP_NODELAY option for accepted connections.
    ///
    /// Defaults to enabled (true).
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.grpc = self.grpc.tcp_nodelay(enabled);
        self
    }

    /// Intercept inbound requests and add a [tracing::Span][Span] to each response future.
    pub fn trace_fn<F>(mut self, f: F) -> Self
    where F: Fn(&http::Request<()>) -> Span + Send + Sync + 'static {
        self.grpc = self.grpc.trace_fn(f);
        self
    }
}

impl Broker {
    /// Wire every component together. Must be called within a tokio runtime, as queued
    /// consumers spawn their workers immediately.
    pub fn build(self) -> BrokerNode {
        let metrics = Arc::new(Metrics::new());

        let membership: Arc<dyn Membership>;
        let mut refresh: Option<BoxFuture<'static, ()>> = None;

        match self.discovery {
            None => membership = Arc::new(Standalone::new(self.local.clone())),
            Some(d) => {
                let mut transport = GrpcTransport::new();
                if let Some(tls) = self.client_tls {
                    transport = transport.with_tls(tls);
                }

                let m = Arc::new(DiscoveryMembership::new(
                    self.membership_cfg,
                    self.local.clone(),
                    d,
                    transport,
                ));
                refresh = Some(Arc::clone(&m).run().boxed());
                membership = m;
            }
        }

        let registry = Arc::new(ServiceRegistry::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&membership), Arc::clone(&metrics)));
        let upstream = UpstreamManager::new(
            self.upstream_cfg,
            self.connector,
            Arc::clone(&registry),
            self.filters,
            Arc::clone(&metrics),
        );

        let health = Arc::new(self.health);
        health.expose(&registry, &upstream, self.local.node_id());

        let window = self.dedup_window;
        let registry_consumer = RegistryConsumer::new(Arc::clone(&registry));
        bus.subscribe(Dedup::new(registry_consumer, window), DeliveryPolicy::Inline);

        // connecting can be slow; keep it off the publishing path.
        let upstream_consumer = UpstreamConsumer::new(Arc::clone(&upstream));
        bus.subscribe(Dedup::new(upstream_consumer, window), DeliveryPolicy::Queued);

        if let Some((store, scope)) = self.config {
            let fwd = ConfigForwarder::new(store, &scope);
            bus.subscribe(Dedup::new(fwd, window), DeliveryPolicy::Queued);
        }
        if let Some(cache) = self.cache {
            let fwd = CacheForwarder::new(cache);
            bus.subscribe(Dedup::new(fwd, window), DeliveryPolicy::Queued);
        }

        let bridge = Arc::new(DiscoveryBridge::new(Arc::clone(&registry), Arc::clone(&membership)));

        BrokerNode {
            grpc: self.grpc,
            refresh,
            reap_every: REAP_INTERVAL,
            membership,
            registry,
            bus,
            upstream,
            health,
            bridge,
            metrics,
            auth: self.auth,
        }
    }
}

/// A broker with every component wired together, ready to be served.
pub struct BrokerNode {
    grpc: Server,
    refresh: Option<BoxFuture<'static, ()>>,
    reap_every: Duration,
    membership: Arc<dyn Membership>,
    registry: Arc<ServiceRegistry>,
    bus: Arc<EventBus>,
    upstream: Arc<UpstreamManager>,
    health: Arc<HealthAggregator>,
    bridge: Arc<DiscoveryBridge>,
    metrics: Arc<Metrics>,
    auth: Option<Arc<dyn AuthenticationService>>,
}

impl BrokerNode {
    /// Returns cluster membership.
    pub fn membership(&self) -> &Arc<dyn Membership> {
        &self.membership
    }

    /// Returns the service registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Returns the event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Returns the upstream manager.
    pub fn upstream(&self) -> &Arc<UpstreamManager> {
        &self.upstream
    }

    /// Returns the health aggregator.
    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    /// Returns the discovery bridge.
    pub fn discovery(&self) -> &Arc<DiscoveryBridge> {
        &self.bridge
    }

    /// Returns the metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Create a routing context for a call addressed to `locator`.
    ///
    /// If an [AuthenticationService] is configured and `credentials` are given, they must
    /// verify, and the resulting principal is attached to the context.
    pub async fn context(
        &self,
        locator: &ServiceLocator,
        credentials: Option<&str>,
    ) -> Result<FilterContext, AuthError> {
        let ctx = self.upstream.context(locator);

        match (&self.auth, credentials) {
            (Some(auth), Some(creds)) => Ok(ctx.with_principal(auth.authenticate(creds).await?)),
            _ => Ok(ctx),
        }
    }

    /// Announce that `route` serves `locators`, cluster-wide.
    pub async fn expose(&self, route: &ServiceRoute, locators: &[ServiceLocator]) -> BroadcastReport {
        let m = proto::ServiceExposed {
            app_id: route.app_id().to_owned(),
            app_name: route.name().to_owned(),
            node_id: route.node_id().to_string(),
            locators: locators.iter().map(proto::Locator::from).collect(),
            weight: route.load_weight(),
            tags: route.tags().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };

        self.bus.emit(&Event::ServiceExposed(m)).await
    }

    /// Announce that `app_id` no longer serves `locators`, cluster-wide. An empty list
    /// retracts every locator of the app.
    pub async fn retract(&self, app_id: &str, locators: &[ServiceLocator]) -> BroadcastReport {
        let m = proto::ServiceRetracted {
            app_id: app_id.to_owned(),
            locators: locators.iter().map(proto::Locator::from).collect(),
        };

        self.bus.emit(&Event::ServiceRetracted(m)).await
    }

    /// Announce a lifecycle change of `app_id`, cluster-wide.
    pub async fn set_status(&self, app_id: &str, status: proto::AppStatus) -> BroadcastReport {
        let mut m = proto::AppStatusChanged {
            app_id: app_id.to_owned(),
            ..Default::default()
        };
        m.set_status(status);

        self.bus.emit(&Event::AppStatusChanged(m)).await
    }

    /// Consume this [BrokerNode], creating a future that will run on a tokio executor.
    ///
    /// Resolves once the broker has exited.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), tonic::transport::Error> {
        self.serve_with_shutdown(addr, pending()).await
    }

    /// Consume this [BrokerNode], creating a future that will run on a tokio executor.
    ///
    /// Shutdown will be initiated when `signal` resolves.
    ///
    /// Resolves once the broker has exited.
    pub async fn serve_with_shutdown<F>(self, addr: SocketAddr, signal: F) -> Result<(), tonic::transport::Error>
    where F: Future<Output = ()> + Send {
        #[rustfmt::skip]
        let BrokerNode { mut grpc, refresh, reap_every, membership, registry, bus, upstream, health, metrics, .. } = self;

        let link = BrokerLinkServer::new(BrokerLinkService { bus, health });
        let refresh = refresh.unwrap_or_else(|| pending().boxed());
        let liveness = follow_membership(membership.subscribe(), registry, Arc::clone(&upstream), metrics);
        let reaper = reap(upstream, reap_every);

        info!("broker {} serving on {}", membership.local_broker().node_id(), addr);

        tokio::select! {
            r = grpc.add_service(link).serve_with_shutdown(addr, signal) => r,
            r = refresh.then(|_| pending()) => r,
            r = liveness.then(|_| pending()) => r,
            r = reaper.then(|_| pending()) => r,
        }
    }
}

/// Drop routes and endpoints attached to brokers that left the cluster, and keep the
/// peer gauge current.
async fn follow_membership(
    mut changes: Subscription,
    registry: Arc<ServiceRegistry>,
    upstream: Arc<UpstreamManager>,
    metrics: Arc<Metrics>,
) {
    while let Ok(change) = changes.recv().await {
        metrics.set_peers(change.peers().count());

        if change.skipped() > 0 {
            warn!("missed {} membership changes", change.skipped());
        }

        for b in change.left().iter() {
            let routes = registry.unregister_node(b.node_id());
            let endpoints = upstream.purge_node(b.node_id());
            debug!(
                "{} left: dropped {} routes and {} endpoints",
                b.node_id(),
                routes.len(),
                endpoints
            );
        }
    }
}

async fn reap(upstream: Arc<UpstreamManager>, every: Duration) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        upstream.reap(Instant::now());
    }
}

/// Serves the broker-to-broker channel.
struct BrokerLinkService {
    bus: Arc<EventBus>,
    health: Arc<HealthAggregator>,
}

#[crate::async_trait]
impl BrokerLink for BrokerLinkService {
    #[tracing::instrument(skip(self, req))]
    async fn deliver(&self, req: Request<proto::Envelope>) -> Result<Response<proto::Ack>, Status> {
        let env = Envelope::from(req.into_inner());
        if env.ty().is_empty() {
            return Err(Status::invalid_argument("envelope has no type"));
        }

        self.bus.receive_from_peer(&env).await;
        Ok(Response::new(proto::Ack {}))
    }

    #[tracing::instrument(skip(self, req))]
    async fn check(
        &self,
        req: Request<proto::HealthCheckRequest>,
    ) -> Result<Response<proto::HealthCheckResponse>, Status> {
        let status = self.health.check(&req.into_inner().service).await;
        Ok(Response::new(status.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::tests::broker,
        health::{HealthStatus, HEALTH_SERVICE},
        upstream::{Endpoint, EndpointError},
    };

    struct Refuse;

    #[crate::async_trait]
    impl Connector for Refuse {
        async fn connect(&self, _: &ServiceRoute) -> Result<Arc<dyn Endpoint>, EndpointError> {
            Err(EndpointError::Connect("refused".into()))
        }
    }

    struct Slow;

    #[crate::async_trait]
    impl HealthIndicator for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn is_healthy(&self) -> bool {
            tokio::time::sleep(Duration::from_secs(5)).await;
            true
        }
    }

    struct Token;

    #[crate::async_trait]
    impl AuthenticationService for Token {
        async fn authenticate(&self, credentials: &str) -> Result<crate::external::Principal, AuthError> {
            match credentials {
                "good" => Ok(crate::external::Principal::new("svc-a")),
                _ => Err(AuthError::InvalidCredentials),
            }
        }
    }

    #[tokio::test]
    async fn built_node_serves_health_locally() {
        let node = Broker::new(broker("n1", 1), Refuse).build();
        let locator = ServiceLocator::new("", HEALTH_SERVICE, "");

        assert!(node.registry().contains(&locator));
        assert_eq!(HealthStatus::Unknown, node.health().check("").await);
        assert_eq!(0, node.membership().peer_count());
    }

    #[tokio::test]
    async fn credentials_are_verified() {
        let node = Broker::new(broker("n1", 1), Refuse).authentication(Token).build();
        let l = ServiceLocator::new("g", "Orders", "1");

        let ctx = node.context(&l, Some("good")).await.unwrap();
        assert_eq!("svc-a", ctx.principal().unwrap().subject);

        let err = node.context(&l, Some("bad")).await.err().unwrap();
        assert_eq!(AuthError::InvalidCredentials, err);

        assert!(node.context(&l, None).await.unwrap().principal().is_none());
    }

    #[tokio::test]
    async fn exposure_reaches_the_registry() {
        let node = Broker::new(broker("n1", 1), Refuse).build();
        let route = ServiceRoute::new("a1", "a1", "n1").app_name("orders");
        let l = ServiceLocator::new("g", "Orders", "1");

        let report = node.expose(&route, &[l.clone()]).await;
        assert!(report.is_complete());
        assert_eq!(1, node.registry().lookup(&l).len());

        node.set_status("a1", proto::AppStatus::OutOfService).await;
        assert!(!node.registry().contains(&l));

        node.set_status("a1", proto::AppStatus::Serving).await;
        node.retract("a1", &[]).await;
        assert!(!node.registry().contains(&l));
    }

    #[tokio::test]
    async fn slow_handlers_are_cut_off() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let node = Broker::new(broker("n1", addr.port()), Refuse)
            .add_indicator(Slow)
            .timeout(Duration::from_millis(50))
            .build();

        let started = Instant::now();
        let check = async {
            let uri = format!("http://{}", addr);
            let mut client = loop {
                match proto::broker_link_client::BrokerLinkClient::connect(uri.clone()).await {
                    Ok(c) => break c,
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            };
            client.check(proto::HealthCheckRequest::default()).await
        };

        let status = tokio::select! {
            r = node.serve(addr) => panic!("broker exited early: {:?}", r),
            r = check => r.err().unwrap(),
        };
        assert_eq!(tonic::Code::Cancelled, status.code());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
