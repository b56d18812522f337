
use bytes::Bytes;
use shared::{broker, eventually, init_logger, EchoConnector};
use std::time::{Duration, Instant};
use switchyard::{
    cluster::proto::AppStatus,
    filter::CanaryFilter,
    registry::ServiceRoute,
    upstream::{Backoff, DestinationKey, RouteError, UpstreamConfig},
    Broker, BrokerNode, ServiceLocator,
};

fn route(app_id: &str) -> ServiceRoute {
    ServiceRoute::new(app_id, app_id, "n1").app_name("orders")
}

fn pool_len(node: &BrokerNode, l: &ServiceLocator) -> usize {
    (node.upstream().pool(&DestinationKey::from(l))).map_or(0, |p| p.len())
}

async fn wait_for_pool(node: &BrokerNode, l: &ServiceLocator, len: usize) {
    let what = format!("{} endpoint(s) serving {}", len, l);
    eventually(&what, || async move { pool_len(node, l) == len }).await;
}

async fn call(node: &BrokerNode, l: &ServiceLocator) -> Result<(String, Bytes), RouteError> {
    let mut ctx = node.context(l, None).await.unwrap();
    let resp = node.upstream().call(&mut ctx, Bytes::from_static(b"ping")).await?;
    Ok((ctx.version().to_owned(), resp))
}

/// Tests that the canary filter shifts exactly its share of calls, and that calls fall back
/// to the addressed version once every canary endpoint is dead.
#[tokio::test]
async fn canary_share_and_fallback() {
    init_logger();
    let connector = EchoConnector::default();
    let node = Broker::new(broker("n1", 1), connector.clone())
        .add_filter(CanaryFilter::new(vec!["Orders"], "2", 30))
        .build();

    let v1 = ServiceLocator::new("g", "Orders", "1");
    let v2 = ServiceLocator::new("g", "Orders", "2");
    assert!(node.expose(&route("v1-app"), &[v1.clone()]).await.is_complete());
    assert!(node.expose(&route("v2-app"), &[v2.clone()]).await.is_complete());
    wait_for_pool(&node, &v1, 1).await;
    wait_for_pool(&node, &v2, 1).await;

    let mut canary = 0;
    for _ in 0..100 {
        let (version, resp) = call(&node, &v1).await.unwrap();
        assert_eq!(&b"ping"[..], &resp[..]);
        if version == "2" {
            canary += 1;
        }
    }
    assert_eq!(30, canary);
    assert_eq!(70, connector.endpoint("v1-app").unwrap().served());
    assert_eq!(30, connector.endpoint("v2-app").unwrap().served());

    // keep the dead canary from being reconnected behind our back.
    connector.refuse(true);
    connector.endpoint("v2-app").unwrap().kill();

    for _ in 0..100 {
        let (version, _) = call(&node, &v1).await.unwrap();
        assert_eq!("1", version);
    }
    assert_eq!(170, connector.endpoint("v1-app").unwrap().served());
    assert_eq!(0, pool_len(&node, &v2));
}

/// Tests that calls are spread across endpoints in proportion to their weights.
#[tokio::test]
async fn weighted_round_robin() {
    init_logger();
    let connector = EchoConnector::default();
    let node = Broker::new(broker("n1", 1), connector.clone()).build();

    let l = ServiceLocator::new("g", "Orders", "1");
    node.expose(&route("heavy").weight(2), &[l.clone()]).await;
    node.expose(&route("light"), &[l.clone()]).await;
    wait_for_pool(&node, &l, 2).await;

    for _ in 0..30 {
        call(&node, &l).await.unwrap();
    }

    assert_eq!(20, connector.endpoint("heavy").unwrap().served());
    assert_eq!(10, connector.endpoint("light").unwrap().served());
}

/// Tests that lifecycle events take endpoints out of rotation and bring them back.
#[tokio::test]
async fn status_changes_park_and_restore() {
    init_logger();
    let connector = EchoConnector::default();
    let node = Broker::new(broker("n1", 1), connector.clone()).build();

    let l = ServiceLocator::new("g", "Orders", "1");
    node.expose(&route("a1"), &[l.clone()]).await;
    wait_for_pool(&node, &l, 1).await;

    node.set_status("a1", AppStatus::OutOfService).await;
    wait_for_pool(&node, &l, 0).await;
    assert!(matches!(call(&node, &l).await, Err(RouteError::NoAvailableEndpoint(_))));

    node.set_status("a1", AppStatus::Serving).await;
    wait_for_pool(&node, &l, 1).await;
    call(&node, &l).await.unwrap();

    node.retract("a1", &[]).await;
    wait_for_pool(&node, &l, 0).await;
    eventually("registry to forget a1", || {
        let gone = !node.registry().contains(&l);
        async move { gone }
    })
    .await;
}

/// Tests that a retraction made while an app is out of service survives its return.
#[tokio::test]
async fn retraction_while_out_of_service_sticks() {
    init_logger();
    let connector = EchoConnector::default();
    let node = Broker::new(broker("n1", 1), connector.clone()).build();

    let (v1, v2) = (ServiceLocator::new("g", "Orders", "1"), ServiceLocator::new("g", "Orders", "2"));
    node.expose(&route("a1"), &[v1.clone(), v2.clone()]).await;
    wait_for_pool(&node, &v2, 1).await;

    node.set_status("a1", AppStatus::OutOfService).await;
    node.retract("a1", &[v2.clone()]).await;
    node.set_status("a1", AppStatus::Serving).await;
    wait_for_pool(&node, &v1, 1).await;

    assert!(node.registry().contains(&v1));
    assert!(!node.registry().contains(&v2));
    assert_eq!(0, pool_len(&node, &v2));
}

/// Tests that a service exposed while its app is out of service waits for the app to serve.
#[tokio::test]
async fn exposure_while_out_of_service_waits() {
    init_logger();
    let connector = EchoConnector::default();
    let node = Broker::new(broker("n1", 1), connector.clone()).build();

    let (v1, v2) = (ServiceLocator::new("g", "Orders", "1"), ServiceLocator::new("g", "Orders", "2"));
    node.expose(&route("a1"), &[v1.clone()]).await;
    wait_for_pool(&node, &v1, 1).await;

    node.set_status("a1", AppStatus::OutOfService).await;
    wait_for_pool(&node, &v1, 0).await;
    node.expose(&route("a1"), &[v2.clone()]).await;

    assert!(!node.registry().contains(&v2));
    assert!(matches!(call(&node, &v2).await, Err(RouteError::NoAvailableEndpoint(_))));

    node.set_status("a1", AppStatus::Serving).await;
    wait_for_pool(&node, &v2, 1).await;
    assert!(node.registry().contains(&v1));
    assert!(node.registry().contains(&v2));
}

/// Tests that an endpoint that dies and can't be reconnected loses its routes, and its
/// pools are reaped.
#[tokio::test]
async fn unreachable_endpoints_are_dropped() {
    init_logger();
    let connector = EchoConnector::default();
    let cfg = UpstreamConfig {
        drain_grace: Duration::from_millis(10),
        reconnect: Backoff {
            base: Duration::from_millis(10),
            max: Duration::from_millis(20),
            max_attempts: 2,
        },
        ..UpstreamConfig::new()
    };
    let node = Broker::new(broker("n1", 1), connector.clone()).upstream_config(cfg).build();

    let l = ServiceLocator::new("g", "Orders", "1");
    node.expose(&route("a1"), &[l.clone()]).await;
    wait_for_pool(&node, &l, 1).await;

    connector.refuse(true);
    connector.endpoint("a1").unwrap().kill();
    assert!(matches!(call(&node, &l).await, Err(RouteError::NoAvailableEndpoint(_))));
    assert!(!node.registry().contains(&l));

    eventually("reconnecting a1 to give up", || {
        let done = node.upstream().pending_reconnects() == 0 && !node.registry().is_parked("a1");
        async move { done }
    })
    .await;
    assert!(node.registry().lookup(&l).is_empty());
    assert!(node.registry().routes_for_app("orders").is_empty());

    assert_eq!(2, node.upstream().reap(Instant::now() + Duration::from_secs(1)));
    assert!(node.upstream().pool(&DestinationKey::from(&l)).is_none());
}

/// Tests that an endpoint that can't be connected yet is retried until it comes up.
#[tokio::test]
async fn refused_connections_are_retried() {
    init_logger();
    let connector = EchoConnector::default();
    connector.refuse(true);
    let node = Broker::new(broker("n1", 1), connector.clone()).build();

    let l = ServiceLocator::new("g", "Orders", "1");
    node.expose(&route("a1"), &[l.clone()]).await;
    eventually("a reconnect to be scheduled", || {
        let pending = node.upstream().pending_reconnects();
        async move { pending == 1 }
    })
    .await;
    assert_eq!(0, pool_len(&node, &l));

    connector.refuse(false);
    wait_for_pool(&node, &l, 1).await;
    assert_eq!(0, node.upstream().pending_reconnects());
}
