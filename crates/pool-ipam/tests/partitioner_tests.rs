//! Integration tests for pool partitioning
//!
//! Drives the partitioner and the controller loop against the in-memory
//! registry, including the full drain handshake with a node engine.

use pool_ipam::config::ControllerConfig;
use pool_ipam::engine::{EngineConfig, NodeEngine, ReleaseReporter};
use pool_ipam::models::{AssignmentRecord, AssignmentState, NodeInfo, NodeSelector, PoolSpec};
use pool_ipam::partitioner::{
    BackoffConfig, PartitionController, PartitionPolicy, PoolPartitioner, RemainderPolicy,
};
use pool_ipam::protocol::{AllocateRequest, AllocationService, ReleaseRequest};
use pool_ipam::registry::{ClusterRegistry, InMemoryRegistry};
use pool_ipam::store::MemoryStore;
use pool_ipam::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn labeled(name: &str) -> NodeInfo {
    NodeInfo::new(name).with_label("ipam", "on")
}

fn selector() -> NodeSelector {
    NodeSelector::everything().with_label("ipam", "on")
}

fn setup(spec: PoolSpec, nodes: &[&str]) -> (Arc<InMemoryRegistry>, PoolPartitioner) {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.apply_pool(&spec.with_selector(selector())).unwrap();
    for node in nodes {
        registry.upsert_node(labeled(node));
    }
    let partitioner = PoolPartitioner::new(registry.clone(), PartitionPolicy::default());
    (registry, partitioner)
}

async fn records(registry: &InMemoryRegistry, pool: &str) -> Vec<AssignmentRecord> {
    registry.list_assignments(pool).await.unwrap()
}

/// Every record lies in the pool span and no two records overlap
async fn assert_partitioned(registry: &InMemoryRegistry, pool: &str) {
    let span = registry.get_pool(pool).await.unwrap().unwrap().span;
    let records = records(registry, pool).await;
    for (i, a) in records.iter().enumerate() {
        assert!(!a.ranges.is_empty(), "{} has no range", a.node);
        for range in &a.ranges {
            assert!(span.contains_range(range), "{} outside {}", range, span);
        }
        for b in &records[i + 1..] {
            assert!(!a.overlaps(b), "{} overlaps {}", a.node, b.node);
        }
    }
}

/// Poll until `check` holds, failing after a second
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(1), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

// ============================================================================
// Partitioner
// ============================================================================

#[tokio::test]
async fn test_disjoint_across_churn() {
    let spec = PoolSpec::new("p1").with_subnet("10.0.0.0/24").with_block_size(16);
    let (registry, partitioner) = setup(spec, &["n1", "n2", "n3"]);

    partitioner.reconcile("p1").await.unwrap();
    assert_eq!(records(&registry, "p1").await.len(), 3);
    assert_partitioned(&registry, "p1").await;

    registry.upsert_node(labeled("n4"));
    registry.upsert_node(labeled("n5"));
    registry.remove_node("n2");
    partitioner.reconcile("p1").await.unwrap();
    assert_partitioned(&registry, "p1").await;

    let nodes: Vec<String> = records(&registry, "p1")
        .await
        .into_iter()
        .map(|r| r.node)
        .collect();
    assert_eq!(nodes, vec!["n1", "n3", "n4", "n5"]);

    registry.remove_node("n1");
    registry.upsert_node(labeled("n6"));
    partitioner.reconcile("p1").await.unwrap();
    assert_partitioned(&registry, "p1").await;
}

#[tokio::test]
async fn test_same_inputs_same_ranges() {
    let spec = PoolSpec::new("p1").with_subnet("10.1.0.0/24");
    let (first, a) = setup(spec.clone(), &["n3", "n1", "n2"]);
    let (second, b) = setup(spec, &["n2", "n3", "n1"]);

    a.reconcile("p1").await.unwrap();
    b.reconcile("p1").await.unwrap();

    let left: Vec<_> = records(&first, "p1").await.into_iter().map(|r| (r.node, r.ranges)).collect();
    let right: Vec<_> = records(&second, "p1").await.into_iter().map(|r| (r.node, r.ranges)).collect();
    assert_eq!(left, right);
}

#[tokio::test]
async fn test_new_node_leaves_existing_ranges_alone() {
    let spec = PoolSpec::new("p1").with_subnet("10.0.0.0/24").with_block_size(32);
    let (registry, partitioner) = setup(spec, &["n1", "n2"]);
    partitioner.reconcile("p1").await.unwrap();
    let before = records(&registry, "p1").await;

    registry.upsert_node(labeled("n3"));
    let outcome = partitioner.reconcile("p1").await.unwrap();
    assert_eq!(outcome.created, 1);
    assert_eq!(outcome.updated, 0);

    for record in &before {
        let after = registry.assignment("p1", &record.node).unwrap();
        assert_eq!(after.ranges, record.ranges);
        assert_eq!(after.generation, record.generation);
    }
    assert_partitioned(&registry, "p1").await;
}

#[tokio::test]
async fn test_even_split_covers_pool() {
    let spec = PoolSpec::new("p1").with_subnet("10.0.0.0/24");
    let (registry, _) = setup(spec, &["n1", "n2", "n3"]);
    let partitioner = PoolPartitioner::new(
        registry.clone(),
        PartitionPolicy::new(8, RemainderPolicy::Spread),
    );
    partitioner.reconcile("p1").await.unwrap();

    let sizes: Vec<u128> = records(&registry, "p1").await.iter().map(|r| r.size()).collect();
    // 254 usable addresses
    assert_eq!(sizes, vec![85, 85, 84]);
}

#[tokio::test]
async fn test_pool_exhausted_still_places_what_fits() {
    // six usable addresses, two blocks of four requested
    let spec = PoolSpec::new("p1").with_subnet("10.0.0.0/29").with_block_size(4);
    let (registry, partitioner) = setup(spec, &["n1", "n2"]);

    match partitioner.reconcile("p1").await {
        Err(Error::PoolExhausted { pool, unplaced }) => {
            assert_eq!(pool, "p1");
            assert_eq!(unplaced, vec!["n2".to_string()]);
        }
        other => panic!("expected PoolExhausted, got {:?}", other),
    }
    assert!(registry.assignment("p1", "n1").is_some());
    assert!(registry.assignment("p1", "n2").is_none());

    // the error is persistent until capacity appears
    assert!(partitioner.reconcile("p1").await.is_err());
    registry.remove_node("n1");
    partitioner.reconcile("p1").await.unwrap();
    assert!(registry.assignment("p1", "n2").is_some());
}

#[tokio::test]
async fn test_deleted_pool_removes_records() {
    let spec = PoolSpec::new("p1").with_subnet("10.0.0.0/24").with_block_size(16);
    let (registry, partitioner) = setup(spec, &["n1", "n2"]);
    partitioner.reconcile("p1").await.unwrap();

    registry.delete_pool("p1");
    let outcome = partitioner.reconcile("p1").await.unwrap();
    assert!(outcome.pool_removed);
    assert_eq!(outcome.deleted, 2);
    assert!(records(&registry, "p1").await.is_empty());
}

#[tokio::test]
async fn test_registry_write_failure_is_retryable() {
    let spec = PoolSpec::new("p1").with_subnet("10.0.0.0/24").with_block_size(16);
    let (registry, partitioner) = setup(spec, &["n1"]);

    registry.set_fail_writes(true);
    let err = partitioner.reconcile("p1").await.unwrap_err();
    assert!(err.is_retryable());

    registry.set_fail_writes(false);
    partitioner.reconcile("p1").await.unwrap();
    assert!(registry.assignment("p1", "n1").is_some());
}

// ============================================================================
// Drain handshake
// ============================================================================

#[tokio::test]
async fn test_drain_handshake_frees_range_after_last_release() {
    let spec = PoolSpec::new("p1").with_subnet("10.0.0.0/24").with_block_size(16);
    let (registry, partitioner) = setup(spec, &["n1", "n2"]);
    partitioner.reconcile("p1").await.unwrap();

    let (engine, released) =
        NodeEngine::new("n2", EngineConfig::default(), Arc::new(MemoryStore::new()));
    let engine = Arc::new(engine);
    engine
        .recover(&registry.node_assignments("n2").await.unwrap())
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = ReleaseReporter::new("n2", registry.clone(), BackoffConfig::default());
    let reporter = tokio::spawn(reporter.run(released, shutdown_rx));

    let allocated = engine
        .allocate(AllocateRequest::new("p1", "c1", "eth0"))
        .await
        .unwrap();
    assert_eq!(allocated.address.to_string(), "10.0.0.17");

    // n2 stays in the cluster but leaves the selector
    registry.upsert_node(NodeInfo::new("n2"));
    partitioner.reconcile("p1").await.unwrap();
    let draining = registry.assignment("p1", "n2").unwrap();
    assert_eq!(draining.state, AssignmentState::Draining);
    engine.apply_assignment(&draining).await.unwrap();

    let refused = engine.allocate(AllocateRequest::new("p1", "c2", "eth0")).await;
    assert!(matches!(refused, Err(Error::NotReady(_))));

    // no ack while c1 holds an address: the record survives a reconcile
    partitioner.reconcile("p1").await.unwrap();
    assert!(registry.assignment("p1", "n2").is_some());

    engine
        .release(ReleaseRequest::new("p1", "c1", "eth0"))
        .await
        .unwrap();
    let reg = registry.clone();
    eventually(|| {
        let reg = reg.clone();
        async move { !reg.release_acks("p1").await.unwrap().is_empty() }
    })
    .await;
    let ack = &registry.release_acks("p1").await.unwrap()[0];
    assert_eq!(ack.generation, draining.generation);

    partitioner.reconcile("p1").await.unwrap();
    assert!(registry.assignment("p1", "n2").is_none());

    engine.remove_assignment("p1").await.unwrap();
    assert!(matches!(
        engine.allocations("p1").await,
        Err(Error::PoolNotFound(_))
    ));

    shutdown_tx.send(true).unwrap();
    reporter.await.unwrap();
}

#[tokio::test]
async fn test_rejoining_node_is_reactivated() {
    let spec = PoolSpec::new("p1").with_subnet("10.0.0.0/24").with_block_size(16);
    let (registry, partitioner) = setup(spec, &["n1"]);
    partitioner.reconcile("p1").await.unwrap();
    let active = registry.assignment("p1", "n1").unwrap();

    registry.upsert_node(NodeInfo::new("n1"));
    partitioner.reconcile("p1").await.unwrap();
    assert_eq!(
        registry.assignment("p1", "n1").unwrap().state,
        AssignmentState::Draining
    );

    registry.upsert_node(labeled("n1"));
    partitioner.reconcile("p1").await.unwrap();
    let rejoined = registry.assignment("p1", "n1").unwrap();
    assert_eq!(rejoined.state, AssignmentState::Active);
    assert_eq!(rejoined.ranges, active.ranges);
    assert!(rejoined.generation > active.generation);
}

#[tokio::test]
async fn test_shrunk_pool_never_reissues_live_addresses() {
    let wide = PoolSpec::new("p1")
        .with_subnet("10.0.0.0/24")
        .with_range("10.0.0.1", "10.0.0.8");
    let (registry, _) = setup(wide, &["n1", "n2"]);
    let partitioner = PoolPartitioner::new(
        registry.clone(),
        PartitionPolicy::new(1, RemainderPolicy::Spread),
    );
    partitioner.reconcile("p1").await.unwrap();
    assert_eq!(
        registry.assignment("p1", "n2").unwrap().ranges,
        vec!["10.0.0.5-10.0.0.8".parse().unwrap()]
    );

    let (n2, released) =
        NodeEngine::new("n2", EngineConfig::default(), Arc::new(MemoryStore::new()));
    let n2 = Arc::new(n2);
    n2.recover(&registry.node_assignments("n2").await.unwrap())
        .await
        .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = ReleaseReporter::new("n2", registry.clone(), BackoffConfig::default());
    let reporter = tokio::spawn(reporter.run(released, shutdown_rx));
    for cid in ["c1", "c2"] {
        n2.allocate(AllocateRequest::new("p1", cid, "eth0"))
            .await
            .unwrap();
    }

    // the range now ends inside n2's block, and n3 joins
    registry
        .apply_pool(
            &PoolSpec::new("p1")
                .with_subnet("10.0.0.0/24")
                .with_range("10.0.0.1", "10.0.0.6")
                .with_selector(selector()),
        )
        .unwrap();
    registry.upsert_node(labeled("n3"));
    let err = partitioner.reconcile("p1").await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));

    let draining = registry.assignment("p1", "n2").unwrap();
    assert_eq!(draining.state, AssignmentState::Draining);
    assert!(registry.assignment("p1", "n3").is_none());
    n2.apply_assignment(&draining).await.unwrap();

    // one live allocation left: still owned by n2
    n2.release(ReleaseRequest::new("p1", "c1", "eth0"))
        .await
        .unwrap();
    assert!(partitioner.reconcile("p1").await.is_err());
    assert!(registry.assignment("p1", "n3").is_none());

    n2.release(ReleaseRequest::new("p1", "c2", "eth0"))
        .await
        .unwrap();
    let reg = registry.clone();
    eventually(|| {
        let reg = reg.clone();
        async move { !reg.release_acks("p1").await.unwrap().is_empty() }
    })
    .await;

    partitioner.reconcile("p1").await.unwrap();
    assert_partitioned(&registry, "p1").await;
    let recarved = registry.assignment("p1", "n2").unwrap();
    assert_eq!(recarved.ranges, vec!["10.0.0.5".parse().unwrap()]);
    assert_eq!(recarved.generation, draining.generation + 1);
    assert_eq!(
        registry.assignment("p1", "n3").unwrap().ranges,
        vec!["10.0.0.6".parse().unwrap()]
    );

    n2.apply_assignment(&recarved).await.unwrap();
    let (n3, _) = NodeEngine::new("n3", EngineConfig::default(), Arc::new(MemoryStore::new()));
    n3.recover(&registry.node_assignments("n3").await.unwrap())
        .await
        .unwrap();
    let a = n2.allocate(AllocateRequest::new("p1", "c3", "eth0")).await.unwrap();
    let b = n3.allocate(AllocateRequest::new("p1", "c4", "eth0")).await.unwrap();
    assert_ne!(a.address, b.address);

    shutdown_tx.send(true).unwrap();
    reporter.await.unwrap();
}

// ============================================================================
// Controller loop
// ============================================================================

#[tokio::test]
async fn test_controller_follows_registry_events() {
    let registry = Arc::new(InMemoryRegistry::new());
    let config = ControllerConfig {
        resync_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let controller = PartitionController::new(registry.clone(), config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(controller.run(shutdown_rx));

    registry
        .apply_pool(
            &PoolSpec::new("p1")
                .with_subnet("10.0.0.0/24")
                .with_block_size(16)
                .with_selector(selector()),
        )
        .unwrap();
    registry.upsert_node(labeled("n1"));

    let reg = registry.clone();
    eventually(|| {
        let reg = reg.clone();
        async move { reg.assignment("p1", "n1").is_some() }
    })
    .await;

    registry.upsert_node(labeled("n2"));
    let reg = registry.clone();
    eventually(|| {
        let reg = reg.clone();
        async move { reg.assignment("p1", "n2").is_some() }
    })
    .await;
    assert_partitioned(&registry, "p1").await;

    registry.delete_pool("p1");
    let reg = registry.clone();
    eventually(|| {
        let reg = reg.clone();
        async move { reg.list_assignments("p1").await.unwrap().is_empty() }
    })
    .await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
