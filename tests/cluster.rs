
use shared::{broker, init_logger, Loopback};
use std::sync::Arc;
use switchyard::{
    cluster::{proto, DiscoveryMembership, MembershipConfig},
    event::{ConfigWatch, DeliveryPolicy},
    metrics::Metrics,
    registry::RegistryConsumer,
    BrokerInfo, Event, EventBus, Membership, ServiceLocator, ServiceRegistry,
};

struct Node {
    membership: Arc<DiscoveryMembership<Vec<BrokerInfo>, Loopback>>,
    bus: Arc<EventBus>,
    registry: Arc<ServiceRegistry>,
    metrics: Arc<Metrics>,
}

/// Wires `n` brokers together through a shared [Loopback], each with a registry
/// consumer, and refreshes their membership once.
async fn cluster(n: u16, net: &Loopback) -> Vec<Node> {
    let all: Vec<_> = (1..=n).map(|i| broker(&format!("n{}", i), i)).collect();
    let mut nodes = Vec::new();

    for local in all.iter() {
        let membership = Arc::new(DiscoveryMembership::new(
            MembershipConfig::low_latency(),
            local.clone(),
            all.clone(),
            net.clone(),
        ));
        membership.refresh().await.unwrap();

        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new(membership.clone(), Arc::clone(&metrics)));
        let registry = Arc::new(ServiceRegistry::new());
        bus.subscribe(RegistryConsumer::new(Arc::clone(&registry)), DeliveryPolicy::Inline);
        net.attach(&bus);

        nodes.push(Node {
            membership,
            bus,
            registry,
            metrics,
        });
    }

    nodes
}

fn exposed(app: &str, node: &str, l: &ServiceLocator) -> Event {
    Event::ServiceExposed(proto::ServiceExposed {
        app_id: app.into(),
        app_name: "orders".into(),
        node_id: node.into(),
        locators: vec![l.into()],
        weight: 1,
        tags: Default::default(),
    })
}

/// Tests that an exposure on one broker reaches the registry of every other broker.
#[tokio::test]
async fn exposure_reaches_every_broker() {
    init_logger();
    let net = Loopback::default();
    let nodes = cluster(3, &net).await;
    let l = ServiceLocator::new("g", "Orders", "1");

    let report = nodes[0].bus.emit(&exposed("a1", "n1", &l)).await;
    assert_eq!(2, report.attempted.len());
    assert!(report.is_complete());

    for n in nodes.iter() {
        assert_eq!(1, n.registry.lookup(&l).len());
        assert_eq!(2, n.membership.peer_count());
    }
}

/// Tests that one unreachable peer is reported without keeping the others from receiving
/// a broadcast.
#[tokio::test]
async fn broadcast_tolerates_an_unreachable_peer() {
    init_logger();
    let net = Loopback::default();
    let nodes = cluster(3, &net).await;
    let l = ServiceLocator::new("g", "Orders", "1");

    net.set_down("n3", true);
    let report = nodes[0].bus.emit(&exposed("a1", "n1", &l)).await;

    assert_eq!(2, report.attempted.len());
    assert_eq!(1, report.delivered());
    assert_eq!("n3", report.failed[0].node_id().as_str());
    assert_eq!(1, nodes[0].metrics.peer_failures());

    assert!(nodes[1].registry.contains(&l));
    assert!(!nodes[2].registry.contains(&l));
    assert_eq!(1, nodes[0].membership.strikes(&"n3".into()));
}

/// Tests that envelopes received from a peer are never forwarded again.
#[tokio::test]
async fn received_envelopes_are_not_rebroadcast() {
    init_logger();
    let net = Loopback::default();
    let nodes = cluster(2, &net).await;
    let l = ServiceLocator::new("g", "Orders", "1");

    nodes[0].bus.emit(&exposed("a1", "n1", &l)).await;

    // n1 only ever published its own envelope.
    assert!(nodes[0].metrics.scrape().contains("switchyard_events_published_total 1\n"));
    assert!(nodes[1].metrics.scrape().contains("switchyard_events_published_total 1\n"));
}

/// Tests that configuration changes are replayed to late watchers on a remote broker.
#[tokio::test]
async fn config_changes_replay_on_peers() {
    init_logger();
    let net = Loopback::default();
    let nodes = cluster(2, &net).await;

    let watch = Arc::new(ConfigWatch::new());
    nodes[1].bus.subscribe(Arc::clone(&watch), DeliveryPolicy::Inline);

    let changed = Event::ConfigChanged(proto::ConfigChanged {
        app_name: "orders".into(),
        content: "retries=3".into(),
    });
    nodes[0].bus.emit(&changed).await;

    let mut w = watch.watch("orders");
    assert_eq!(Some("retries=3".to_owned()), w.recv().await);
    assert_eq!(Some("retries=3".to_owned()), watch.latest("orders"));
}

/// Tests that a subscription always starts from the current view.
#[tokio::test]
async fn subscriptions_start_from_the_current_view() {
    init_logger();
    let net = Loopback::default();
    let nodes = cluster(3, &net).await;

    let mut sub = nodes[1].membership.subscribe();
    let first = sub.recv().await.unwrap();

    assert_eq!(3, first.members().len());
    assert_eq!("n2", first.local_broker().node_id().as_str());
    assert_eq!(2, first.peers().count());
}

/// Tests that a refresh only publishes a change when discovery reports one.
#[tokio::test]
async fn refresh_reports_only_changes() {
    init_logger();
    let net = Loopback::default();
    let all = vec![broker("n1", 1), broker("n2", 2)];

    let m = DiscoveryMembership::new(MembershipConfig::low_latency(), all[0].clone(), all, net);
    let change = m.refresh().await.unwrap().unwrap();
    assert_eq!(1, change.joined().len());
    assert!(m.refresh().await.unwrap().is_none());
}
