// tests/integration/reconcile_test.rs

//! End-to-end coverage of the stale reconciler (spec.md §4.6), exercised
//! over real HTTP between two nodes: offline mode pulls and pushes only
//! tombstones, partition mode additionally pushes locally-newer entities,
//! and the `is_stale` flag only clears once the pass has actually run
//! against a reachable peer.

use super::helpers::{link, new_tenant, TestNode};
use chrono::{Duration, Utc};
use maxiofs_cluster::core::model::EntityType;
use maxiofs_cluster::core::reconcile::StaleReconciler;

/// Marks `node` stale as the health checker would after
/// `now - last_seen >= StalenessThreshold`, optionally leaving
/// `last_local_write_at` set to select partition mode.
async fn mark_stale(node: &TestNode, last_local_write_at: Option<chrono::DateTime<Utc>>) {
    let mut self_row = node.store.get_node(node.id).await.unwrap().unwrap_or_else(|| {
        panic!("test node must register its own row before going stale")
    });
    self_row.is_stale = true;
    self_row.last_local_write_at = last_local_write_at;
    node.store.upsert_node(&self_row).await.unwrap();
}

/// `TestNode::spawn` never inserts the node's own `cluster_nodes` row (only
/// peers register each other); the reconciler reads `get_node(local_node_id)`
/// to check the stale flag, so tests need a self row to flip.
async fn seed_self_row(node: &TestNode) {
    use maxiofs_cluster::core::model::{HealthStatus, Node};
    node.store
        .upsert_node(&Node {
            id: node.id,
            name: format!("self-{}", node.id),
            endpoint: node.endpoint.clone(),
            node_token: node.token.clone(),
            region: "test-region".to_string(),
            priority: 0,
            health_status: HealthStatus::Healthy,
            last_health_check: Some(Utc::now()),
            last_seen: Some(Utc::now() - Duration::days(8)),
            latency_ms: Some(5),
            capacity_bytes: None,
            used_bytes: None,
            is_stale: false,
            last_local_write_at: None,
            metadata: Default::default(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn offline_reconcile_syncs_tombstones_but_pushes_no_entities() {
    let a = TestNode::spawn("a").await;
    let b = TestNode::spawn("b").await;
    link(&a, &b).await;
    seed_self_row(&a).await;

    // B recorded a deletion while A was isolated; A never wrote anything
    // locally during the outage (offline mode).
    let tombstoned_id = uuid::Uuid::new_v4().to_string();
    maxiofs_cluster::core::deletion_log::record_deletion(&b.store, EntityType::Tenant, &tombstoned_id, b.id)
        .await
        .unwrap();

    // A has a local tenant that must NOT be pushed in offline mode, since
    // an offline node accepted no writes and peers are authoritative.
    let local_only = new_tenant("should-not-push");
    a.store.upsert_tenant(&local_only).await.unwrap();

    mark_stale(&a, None).await;

    let reconciler = StaleReconciler::new(a.store.clone(), a.handle.transport.clone(), a.id);
    reconciler.run().await.unwrap();

    assert!(
        maxiofs_cluster::core::deletion_log::has_deletion(&a.store, EntityType::Tenant, &tombstoned_id)
            .await
            .unwrap(),
        "offline reconcile must still two-way-sync tombstones"
    );

    let reloaded = a.store.get_node(a.id).await.unwrap().unwrap();
    assert!(!reloaded.is_stale, "flag must clear after a successful pass");
    assert!(reloaded.last_local_write_at.is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn partition_reconcile_pushes_locally_newer_entities_to_the_peer() {
    let a = TestNode::spawn("a").await;
    let b = TestNode::spawn("b").await;
    link(&a, &b).await;
    seed_self_row(&a).await;

    // Both sides accepted writes to the same tenant id while partitioned;
    // A's copy is strictly newer (spec.md §8 scenario 6).
    let mut tenant = new_tenant("u1");
    let older = tenant.clone();
    tenant.updated_at = Utc::now();
    tenant.display_name = "A's version".to_string();

    let mut on_b = older;
    on_b.updated_at = Utc::now() - Duration::seconds(100);
    on_b.display_name = "B's stale version".to_string();

    a.store.upsert_tenant(&tenant).await.unwrap();
    b.store.upsert_tenant(&on_b).await.unwrap();

    mark_stale(&a, Some(Utc::now())).await;

    let reconciler = StaleReconciler::new(a.store.clone(), a.handle.transport.clone(), a.id);
    reconciler.run().await.unwrap();

    let on_b_after = b.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(on_b_after.display_name, "A's version");
    assert_eq!(on_b_after.updated_at, tenant.updated_at);

    let reloaded = a.store.get_node(a.id).await.unwrap().unwrap();
    assert!(!reloaded.is_stale);
    assert!(reloaded.last_local_write_at.is_none(), "flag clear resets the partition marker too");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn partition_reconcile_does_not_push_entities_the_peer_already_has_newer() {
    let a = TestNode::spawn("a").await;
    let b = TestNode::spawn("b").await;
    link(&a, &b).await;
    seed_self_row(&a).await;

    let mut tenant = new_tenant("u1");
    tenant.updated_at = Utc::now() - Duration::seconds(100);
    tenant.display_name = "A's stale version".to_string();

    let mut on_b = tenant.clone();
    on_b.updated_at = Utc::now();
    on_b.display_name = "B's newer version".to_string();

    a.store.upsert_tenant(&tenant).await.unwrap();
    b.store.upsert_tenant(&on_b).await.unwrap();

    mark_stale(&a, Some(Utc::now())).await;

    let reconciler = StaleReconciler::new(a.store.clone(), a.handle.transport.clone(), a.id);
    reconciler.run().await.unwrap();

    let on_b_after = b.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(on_b_after.display_name, "B's newer version", "B's strictly-newer copy must not be overwritten");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn reconcile_with_no_healthy_peers_leaves_the_node_flagged_for_retry() {
    let a = TestNode::spawn("a").await;
    seed_self_row(&a).await;
    mark_stale(&a, None).await;

    let reconciler = StaleReconciler::new(a.store.clone(), a.handle.transport.clone(), a.id);
    reconciler.run().await.unwrap();

    let reloaded = a.store.get_node(a.id).await.unwrap().unwrap();
    assert!(reloaded.is_stale, "no peers reachable: the next health tick must retry");
}
