// src/core/snapshot.rs

//! The state-snapshot service (C7): builds the lightweight structural
//! summary served at `GET /api/internal/cluster/state-snapshot` and reused
//! directly by the stale reconciler (C6) instead of round-tripping through
//! HTTP against itself.

use crate::core::errors::ClusterResult;
use crate::core::model::{EntityStamp, StateSnapshot};
use crate::core::sync::SyncableEntity;
use crate::core::store::Store;
use uuid::Uuid;

fn stamp<E: SyncableEntity>(entities: &[E]) -> Vec<EntityStamp> {
    entities
        .iter()
        .map(|e| EntityStamp {
            id: e.id_string(),
            updated_at: e.lww_timestamp(),
        })
        .collect()
}

/// Builds the full snapshot for this node: one `(id, updated_at)` stamp per
/// active record of each replicated entity type, plus every tombstone this
/// node knows about (spec.md §4.7).
pub async fn build_snapshot(store: &Store, local_node_id: Uuid) -> ClusterResult<StateSnapshot> {
    use crate::core::model::{AccessKey, BucketPermission, GroupMapping, IdpProvider, Tenant, User};

    let tenants = stamp(&Tenant::list_local(store).await?);
    let users = stamp(&User::list_local(store).await?);
    let access_keys = stamp(&AccessKey::list_local(store).await?);
    let bucket_permissions = stamp(&BucketPermission::list_local(store).await?);
    let idp_providers = stamp(&IdpProvider::list_local(store).await?);
    let group_mappings = stamp(&GroupMapping::list_local(store).await?);
    let tombstones = store.list_all_deletions().await?;

    Ok(StateSnapshot {
        node_id: local_node_id,
        snapshot_at: chrono::Utc::now().timestamp(),
        tenants,
        users,
        access_keys,
        bucket_permissions,
        idp_providers,
        group_mappings,
        tombstones,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Tenant;
    use chrono::Utc;

    #[tokio::test]
    async fn snapshot_includes_active_records_and_tombstones() {
        let store = Store::connect_in_memory().await.unwrap();
        let node_id = Uuid::new_v4();
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
        crate::core::deletion_log::record_deletion(
            &store,
            crate::core::model::EntityType::User,
            "deleted-user",
            node_id,
        )
        .await
        .unwrap();

        let snapshot = build_snapshot(&store, node_id).await.unwrap();
        assert_eq!(snapshot.node_id, node_id);
        assert_eq!(snapshot.tenants.len(), 1);
        assert_eq!(snapshot.tenants[0].id, tenant_id.to_string());
        assert_eq!(snapshot.tombstones.len(), 1);
        assert_eq!(snapshot.tombstones[0].entity_id, "deleted-user");
    }
}
