// src/core/deletion_log.rs

//! The deletion log (C3): a durable, replicated log of tombstones, plus the
//! LWW predicate used to decide whether an incoming tombstone or entity
//! write should be applied.

use crate::core::errors::ClusterResult;
use crate::core::model::{DeletionEntry, EntityType};
use crate::core::store::Store;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

/// Idempotent record of a deletion. Upserting twice for the same
/// `(entity_type, entity_id)` leaves exactly one row (spec.md §8 property 6).
pub async fn record_deletion(
    store: &Store,
    entity_type: EntityType,
    entity_id: &str,
    by_node: Uuid,
) -> ClusterResult<()> {
    store
        .record_deletion(&DeletionEntry {
            id: Uuid::new_v4(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            deleted_by_node_id: by_node,
            deleted_at: Utc::now(),
        })
        .await
}

pub async fn list_deletions(store: &Store, entity_type: EntityType) -> ClusterResult<Vec<DeletionEntry>> {
    store.list_deletions(entity_type).await
}

pub async fn has_deletion(store: &Store, entity_type: EntityType, entity_id: &str) -> ClusterResult<bool> {
    store.has_deletion(entity_type, entity_id).await
}

/// Deletes tombstones older than `max_age`. The cleanup age must be >= the
/// staleness threshold or a node offline longer than the TTL will rejoin,
/// miss tombstones, and resurrect deleted entities (spec.md §9 Open
/// Questions) — `ClusterOrchestrator::validate_startup_invariants` enforces
/// this at boot, this function just does the deletion.
pub async fn cleanup_old_deletions(store: &Store, max_age: Duration) -> ClusterResult<u64> {
    let removed = store.cleanup_old_deletions(max_age).await?;
    if removed > 0 {
        debug!(removed, "cleaned up aged-out tombstones");
    }
    Ok(removed)
}

/// Looks up the timestamp that would be compared against a tombstone for
/// the given entity, per spec.md §7 `EntityIsNewerThanTombstone`. Entity
/// types lacking a native LWW clock (`AccessKey`, `BucketPermission`)
/// report `None` unconditionally so the caller's tombstone-wins fallback
/// engages — `has_lww_clock` documents this once, instead of scattering
/// `match` arms at every call site.
pub async fn entity_updated_at(
    store: &Store,
    entity_type: EntityType,
    entity_id: &str,
) -> ClusterResult<Option<DateTime<Utc>>> {
    if !entity_type.has_lww_clock() {
        return Ok(None);
    }
    let Ok(id) = Uuid::parse_str(entity_id) else {
        return Ok(None);
    };

    Ok(match entity_type {
        EntityType::Tenant => store.get_tenant(id).await?.map(|t| t.updated_at),
        EntityType::User => store.get_user(id).await?.map(|u| u.updated_at),
        EntityType::IdpProvider => store.get_idp_provider(id).await?.map(|p| p.updated_at),
        EntityType::GroupMapping => store.get_group_mapping(id).await?.map(|g| g.updated_at),
        EntityType::AccessKey | EntityType::BucketPermission => unreachable!("filtered above"),
    })
}

/// `EntityIsNewerThanTombstone(type, id, tombstone_ts)` (spec.md §7): the
/// gate the receive-side delete handler and the reconciler both use. For
/// entity types without a native update timestamp this always returns
/// `false` — tombstones always win, a conservative choice documented in
/// `DESIGN.md`.
pub async fn entity_is_newer_than_tombstone(
    store: &Store,
    entity_type: EntityType,
    entity_id: &str,
    tombstone_ts: DateTime<Utc>,
) -> ClusterResult<bool> {
    if !entity_type.has_lww_clock() {
        return Ok(false);
    }

    Ok(match entity_updated_at(store, entity_type, entity_id).await? {
        None => false,
        Some(ts) => ts > tombstone_ts,
    })
}

/// Applies an incoming tombstone locally, subject to LWW. Returns `true`
/// if the tombstone was recorded, `false` if it was dropped because the
/// local entity is strictly newer.
pub async fn apply_incoming_tombstone(
    store: &Store,
    entity_type: EntityType,
    entity_id: &str,
    deleted_by_node_id: Uuid,
    deleted_at: DateTime<Utc>,
) -> ClusterResult<bool> {
    if entity_is_newer_than_tombstone(store, entity_type, entity_id, deleted_at).await? {
        debug!(
            %entity_type, entity_id, "ignoring tombstone older than local entity"
        );
        return Ok(false);
    }

    store
        .record_deletion(&DeletionEntry {
            id: Uuid::new_v4(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            deleted_by_node_id,
            deleted_at,
        })
        .await?;
    // The tombstone is the durable record of the decision; this just makes
    // the local row agree with it so the entity stops showing up in
    // `list_local`/`list_active_*` and getting pushed back out by the next
    // sync tick.
    store.apply_remote_deletion_to_row(entity_type, entity_id).await?;
    info!(%entity_type, entity_id, "applied remote tombstone");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Tenant;

    #[tokio::test]
    async fn record_deletion_is_idempotent() {
        let store = Store::connect_in_memory().await.unwrap();
        let node = Uuid::new_v4();
        record_deletion(&store, EntityType::Tenant, "t1", node)
            .await
            .unwrap();
        record_deletion(&store, EntityType::Tenant, "t1", node)
            .await
            .unwrap();

        let rows = list_deletions(&store, EntityType::Tenant).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_aged_out_rows() {
        let store = Store::connect_in_memory().await.unwrap();
        let node = Uuid::new_v4();
        let fresh = DeletionEntry {
            id: Uuid::new_v4(),
            entity_type: EntityType::User.to_string(),
            entity_id: "fresh".into(),
            deleted_by_node_id: node,
            deleted_at: Utc::now(),
        };
        let old = DeletionEntry {
            id: Uuid::new_v4(),
            entity_type: EntityType::User.to_string(),
            entity_id: "old".into(),
            deleted_by_node_id: node,
            deleted_at: Utc::now() - Duration::days(30),
        };
        store.record_deletion(&fresh).await.unwrap();
        store.record_deletion(&old).await.unwrap();

        let removed = cleanup_old_deletions(&store, Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(has_deletion(&store, EntityType::User, "fresh").await.unwrap());
        assert!(!has_deletion(&store, EntityType::User, "old").await.unwrap());
    }

    #[tokio::test]
    async fn tombstone_loses_to_strictly_newer_entity() {
        let store = Store::connect_in_memory().await.unwrap();
        let tenant_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .upsert_tenant(&Tenant {
                id: tenant_id,
                name: "acme".into(),
                display_name: "Acme".into(),
                status: "active".into(),
                quota_bytes: None,
                quota_objects: None,
                metadata_json: "{}".into(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let older_tombstone = now - Duration::seconds(10);
        assert!(
            entity_is_newer_than_tombstone(&store, EntityType::Tenant, &tenant_id.to_string(), older_tombstone)
                .await
                .unwrap()
        );

        let newer_tombstone = now + Duration::seconds(10);
        assert!(
            !entity_is_newer_than_tombstone(&store, EntityType::Tenant, &tenant_id.to_string(), newer_tombstone)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn applying_an_incoming_tombstone_removes_the_local_row() {
        let store = Store::connect_in_memory().await.unwrap();
        let tenant_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .upsert_tenant(&Tenant {
                id: tenant_id,
                name: "acme".into(),
                display_name: "Acme".into(),
                status: "active".into(),
                quota_bytes: None,
                quota_objects: None,
                metadata_json: "{}".into(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let applied = apply_incoming_tombstone(
            &store,
            EntityType::Tenant,
            &tenant_id.to_string(),
            Uuid::new_v4(),
            now + Duration::seconds(10),
        )
        .await
        .unwrap();
        assert!(applied);

        let tenant = store.get_tenant(tenant_id).await.unwrap().unwrap();
        assert_eq!(tenant.status, "deleted");
    }

    #[tokio::test]
    async fn access_key_tombstone_always_wins() {
        let store = Store::connect_in_memory().await.unwrap();
        // No native updated_at clock: the tombstone always wins, even for a
        // far-future timestamp, because `has_lww_clock` is false.
        assert!(
            !entity_is_newer_than_tombstone(
                &store,
                EntityType::AccessKey,
                "AKIATEST",
                Utc::now() - Duration::days(365),
            )
            .await
            .unwrap()
        );
    }
}
