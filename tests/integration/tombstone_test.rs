// tests/integration/tombstone_test.rs

//! End-to-end tombstone propagation (spec.md §4.4 `syncDeletions`, §4.7):
//! a deletion recorded on one node reaches a peer over real HTTP and wins
//! against that peer's still-present copy of the entity.

use super::helpers::{link, new_tenant, TestNode};
use chrono::Duration;
use maxiofs_cluster::core::deletion_log;
use maxiofs_cluster::core::model::{EntityType, Tenant};
use maxiofs_cluster::core::sync::SyncManager;

#[tokio::test]
async fn deleting_on_one_node_propagates_the_tombstone_and_removes_it_on_the_peer() {
    let a = TestNode::spawn("a").await;
    let b = TestNode::spawn("b").await;
    link(&a, &b).await;

    let tenant = new_tenant("acme");
    a.store.upsert_tenant(&tenant).await.unwrap();
    let manager = SyncManager::<Tenant>::new(a.store.clone(), a.handle.transport.clone(), a.id);
    manager.tick().await;
    assert!(b.store.get_tenant(tenant.id).await.unwrap().is_some());

    a.store.delete_tenant_locally(tenant.id, a.id).await.unwrap();
    deletion_log::record_deletion(&a.store, EntityType::Tenant, &tenant.id.to_string(), a.id)
        .await
        .unwrap();

    manager.tick().await;

    let on_b = b.store.get_tenant(tenant.id).await.unwrap().expect("tombstoned row still present, just marked");
    assert_eq!(on_b.status, "deleted");
    assert!(deletion_log::has_deletion(&b.store, EntityType::Tenant, &tenant.id.to_string())
        .await
        .unwrap());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn a_tombstone_older_than_the_peers_current_record_is_dropped() {
    let a = TestNode::spawn("a").await;
    let b = TestNode::spawn("b").await;
    link(&a, &b).await;

    let tenant = new_tenant("acme");
    b.store.upsert_tenant(&tenant).await.unwrap();

    // A pushes a tombstone dated well before B's copy was last written.
    let old_deleted_at = tenant.updated_at - Duration::seconds(60);
    let url = format!("{}/api/internal/cluster/tenant-delete-sync", b.endpoint);
    let body = maxiofs_cluster::core::model::DeletionEntry {
        id: uuid::Uuid::new_v4(),
        entity_type: EntityType::Tenant.to_string(),
        entity_id: tenant.id.to_string(),
        deleted_by_node_id: a.id,
        deleted_at: old_deleted_at,
    };
    let resp: serde_json::Value = a.handle.transport.post_json(&url, &body).await.unwrap();
    assert_eq!(resp["applied"], false);

    let still_there = b.store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(still_there.status, "active");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn repeated_tombstone_propagation_is_idempotent() {
    let a = TestNode::spawn("a").await;
    let b = TestNode::spawn("b").await;
    link(&a, &b).await;

    let tenant = new_tenant("acme");
    a.store.upsert_tenant(&tenant).await.unwrap();
    let manager = SyncManager::<Tenant>::new(a.store.clone(), a.handle.transport.clone(), a.id);
    manager.tick().await;

    a.store.delete_tenant_locally(tenant.id, a.id).await.unwrap();
    deletion_log::record_deletion(&a.store, EntityType::Tenant, &tenant.id.to_string(), a.id)
        .await
        .unwrap();

    manager.tick().await;
    manager.tick().await;

    let rows = deletion_log::list_deletions(&b.store, EntityType::Tenant).await.unwrap();
    let matching: Vec<_> = rows.iter().filter(|r| r.entity_id == tenant.id.to_string()).collect();
    assert_eq!(matching.len(), 1, "a tombstone pushed twice must still leave exactly one row");

    a.shutdown().await;
    b.shutdown().await;
}
