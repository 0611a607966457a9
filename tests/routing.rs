//! Routing lookups across an in-memory network.
//!
//! Run with: cargo test --test routing

use std::sync::Arc;

use kadmesh::rpc::{PeerFilter, PostRoutingFilter, RoutingConfig, RoutingRequest};
use kadmesh::{Data, Error, Id, PeerAddress, StorageKey, Testnet};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn line_config() -> RoutingConfig {
    RoutingConfig::new(1, 0, 0, 100, 2).unwrap()
}

#[test]
fn line_topology_converges_on_the_closest_reachable_peer() {
    init_tracing();

    let testnet = Testnet::line(7);
    let router = testnet.node(0).router();

    let result = router
        .route(RoutingRequest::new(testnet.node(6).id()), line_config())
        .wait()
        .unwrap();

    assert!(result.success);
    assert_eq!(result.reason, "no new information");
    assert_eq!(result.potential_hits.first(), Some(&testnet.node(5).peer()));
    assert_eq!(result.potential_hits.len(), 6);
    assert!(!result.already_asked.contains(&testnet.node(6).peer()));
    assert_eq!(result.stats.successes, 5);
    assert_eq!(result.stats.failures, 0);
}

#[test]
fn responders_enter_the_routing_table() {
    let testnet = Testnet::line(7);
    let node = testnet.node(0);

    assert_eq!(node.table().size(), 1);

    node.router()
        .route(RoutingRequest::new(testnet.node(6).id()), line_config())
        .wait()
        .unwrap();

    // Peers 1 to 5 answered, peer 6 was never heard of first hand.
    assert_eq!(node.table().size(), 5);
    assert!(!node.table().contains(&testnet.node(6).id()));
}

struct Reject(PeerAddress);

impl PeerFilter for Reject {
    fn reject_pre_routing(&self, peer: &PeerAddress, _known: &[PeerAddress]) -> bool {
        *peer == self.0
    }
}

impl PostRoutingFilter for Reject {
    fn reject_potential_hit(&self, peer: &PeerAddress) -> bool {
        *peer == self.0
    }
}

#[test]
fn pre_routing_filters_drop_reported_neighbors() {
    let testnet = Testnet::line(7);

    let router = testnet
        .node(0)
        .router()
        .with_peer_filter(Arc::new(Reject(testnet.node(5).peer())));

    let result = router
        .route(RoutingRequest::new(testnet.node(6).id()), line_config())
        .wait()
        .unwrap();

    assert_eq!(result.potential_hits.first(), Some(&testnet.node(4).peer()));
    assert_eq!(testnet.node(5).received(), 0);
}

#[test]
fn post_routing_filters_drop_hits_but_not_traffic() {
    let testnet = Testnet::line(7);

    let router = testnet
        .node(0)
        .router()
        .with_post_routing_filter(Arc::new(Reject(testnet.node(5).peer())));

    let result = router
        .route(RoutingRequest::new(testnet.node(6).id()), line_config())
        .wait()
        .unwrap();

    assert_eq!(result.potential_hits.first(), Some(&testnet.node(4).peer()));
    assert!(result.already_asked.contains(&testnet.node(5).peer()));
    assert_eq!(testnet.node(5).received(), 1);
}

#[test]
fn digest_routing_stops_at_a_direct_hit() {
    let testnet = Testnet::new(10);
    let holder = testnet.node(3);

    let location = holder.id();
    holder.store(StorageKey::new(location, Id::ZERO, Id::ZERO), Data::from("value"));

    let config = RoutingConfig::new(1, 5, 3, 20, 3).unwrap();
    let result = testnet
        .node(0)
        .router()
        .route(RoutingRequest::storage_digest(location, Id::ZERO, None), config)
        .wait()
        .unwrap();

    assert!(result.success);
    assert_eq!(result.reason, "enough direct hits");
    assert_eq!(result.direct_hits_count(), 1);
    assert!(result.direct_hits.get(&holder.peer()).is_some());
}

#[test]
fn local_digest_satisfies_routing_without_requests() {
    let testnet = Testnet::new(5);
    let node = testnet.node(0);

    let location = Id::random();
    node.store(StorageKey::new(location, Id::ZERO, Id::ZERO), Data::from("mine"));

    let config = RoutingConfig::new(1, 5, 3, 20, 3).unwrap();
    let result = node
        .router()
        .route(RoutingRequest::storage_digest(location, Id::ZERO, None), config)
        .wait()
        .unwrap();

    assert!(result.success);
    assert_eq!(result.stats.rounds, 0);
    assert!(result.direct_hits.get(&node.peer()).is_some());
    assert!(testnet.nodes().iter().all(|node| node.received() == 0));
}

#[test]
fn random_walk_reaches_other_peers() {
    let testnet = Testnet::new(10);

    let result = testnet
        .node(0)
        .router()
        .route(RoutingRequest::random(), RoutingConfig::default())
        .wait()
        .unwrap();

    assert!(result.success);
    assert!(result.potential_hits.len() > 1);
    assert!(result.direct_hits.is_empty());
}

#[test]
fn bootstrap_fills_an_empty_table() {
    init_tracing();

    let testnet = Testnet::line(7);
    let node = testnet.node(5);

    assert_eq!(node.table().size(), 0);

    let (toward_self, random) = node
        .router()
        .bootstrap(vec![testnet.node(4).peer()], RoutingConfig::default())
        .wait()
        .unwrap();

    assert!(toward_self.success);
    assert!(random.success);
    assert!(toward_self.potential_hits.contains(&testnet.node(4).peer()));
    assert!(node.table().size() >= 5);
}

#[test]
fn bootstrapping_alone_is_not_a_failure() {
    let testnet = Testnet::line(7);

    let (toward_self, _) = testnet
        .node(6)
        .router()
        .bootstrap(Vec::new(), RoutingConfig::default())
        .wait()
        .unwrap();

    assert!(toward_self.success);
    assert_eq!(toward_self.reason, "no peers to route to");
}

#[test]
fn bootstrap_fails_when_no_seed_answers() {
    let testnet = Testnet::line(7);
    testnet.node(4).set_unreachable(true);

    let result = testnet
        .node(5)
        .router()
        .bootstrap(vec![testnet.node(4).peer()], RoutingConfig::default())
        .wait();

    assert!(matches!(result, Err(Error::NoRoute(_))));
}

#[test]
fn cancelled_lookup_answers_nothing_more() {
    let testnet = Testnet::new(6);
    testnet.set_manual(true);

    let handle = testnet
        .node(0)
        .router()
        .route(RoutingRequest::new(Id::random()), RoutingConfig::default());

    assert_eq!(testnet.held(), 3);

    assert!(testnet.release_one());
    assert!(!handle.is_done());

    assert!(handle.cancel());
    assert!(matches!(handle.wait(), Err(Error::Cancelled)));

    let held = testnet.held();
    testnet.release();

    assert_eq!(testnet.held(), 0);
    assert!(held <= 3);
    assert_eq!(
        testnet.nodes().iter().map(|node| node.received()).sum::<usize>(),
        1
    );
}
