// src/core/sync/entities.rs

//! `SyncableEntity` impls for the six replicated catalog types. The
//! duplication here is deliberate — the design notes (spec.md §9) call for
//! the per-entity `canonical_fields` to stay explicit at the call site
//! rather than hidden behind reflection, since a silent field-set change
//! changes checksums and causes sync storms.

use super::{SyncableEntity, canonical_checksum};
use crate::core::errors::ClusterResult;
use crate::core::model::{AccessKey, BucketPermission, EntityType, GroupMapping, IdpProvider, Tenant, User};
use crate::core::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
impl SyncableEntity for Tenant {
    const ENTITY_TYPE: EntityType = EntityType::Tenant;

    fn id_string(&self) -> String {
        self.id.to_string()
    }

    fn checksum(&self) -> String {
        canonical_checksum(&[
            &self.name,
            &self.display_name,
            &self.status,
            &self.quota_bytes.map(|v| v.to_string()).unwrap_or_default(),
            &self.quota_objects.map(|v| v.to_string()).unwrap_or_default(),
            &self.metadata_json,
            &self.updated_at.to_rfc3339(),
        ])
    }

    fn lww_timestamp(&self) -> DateTime<Utc> {
        self.updated_at
    }

    async fn list_local(store: &Store) -> ClusterResult<Vec<Self>> {
        store.list_active_tenants().await
    }

    async fn get_local(store: &Store, id: &str) -> ClusterResult<Option<Self>> {
        match Uuid::parse_str(id) {
            Ok(id) => store.get_tenant(id).await,
            Err(_) => Ok(None),
        }
    }

    async fn upsert(store: &Store, entity: &Self) -> ClusterResult<()> {
        store.upsert_tenant(entity).await
    }
}

#[async_trait]
impl SyncableEntity for User {
    const ENTITY_TYPE: EntityType = EntityType::User;

    fn id_string(&self) -> String {
        self.id.to_string()
    }

    fn checksum(&self) -> String {
        canonical_checksum(&[
            &self.username,
            &self.password_hash,
            &self.status,
            &self.tenant_id.map(|v| v.to_string()).unwrap_or_default(),
            &self.roles_json,
            &self.policies_json,
            self.auth_provider.as_deref().unwrap_or(""),
            self.auth_provider_subject.as_deref().unwrap_or(""),
            &self.updated_at.to_rfc3339(),
        ])
    }

    fn lww_timestamp(&self) -> DateTime<Utc> {
        self.updated_at
    }

    async fn list_local(store: &Store) -> ClusterResult<Vec<Self>> {
        store.list_active_users().await
    }

    async fn get_local(store: &Store, id: &str) -> ClusterResult<Option<Self>> {
        match Uuid::parse_str(id) {
            Ok(id) => store.get_user(id).await,
            Err(_) => Ok(None),
        }
    }

    async fn upsert(store: &Store, entity: &Self) -> ClusterResult<()> {
        store.upsert_user(entity).await
    }
}

#[async_trait]
impl SyncableEntity for AccessKey {
    const ENTITY_TYPE: EntityType = EntityType::AccessKey;

    fn id_string(&self) -> String {
        self.access_key_id.clone()
    }

    fn checksum(&self) -> String {
        canonical_checksum(&[
            &self.secret,
            &self.user_id.to_string(),
            &self.status,
            &self.created_at.to_rfc3339(),
        ])
    }

    /// No native `updated_at`; `created_at` is the LWW clock (spec.md §3,
    /// §9 Open Questions — status flips after creation do not advance it).
    fn lww_timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }

    async fn list_local(store: &Store) -> ClusterResult<Vec<Self>> {
        store.list_active_access_keys().await
    }

    async fn get_local(store: &Store, id: &str) -> ClusterResult<Option<Self>> {
        store.get_access_key(id).await
    }

    async fn upsert(store: &Store, entity: &Self) -> ClusterResult<()> {
        store.upsert_access_key(entity).await
    }
}

#[async_trait]
impl SyncableEntity for BucketPermission {
    const ENTITY_TYPE: EntityType = EntityType::BucketPermission;

    fn id_string(&self) -> String {
        self.id.to_string()
    }

    fn checksum(&self) -> String {
        canonical_checksum(&[
            &self.bucket,
            &self.user_id.map(|v| v.to_string()).unwrap_or_default(),
            &self.tenant_id.map(|v| v.to_string()).unwrap_or_default(),
            &self.permission,
            &self.grantor,
            &self.granted_at.to_rfc3339(),
            &self.expires_at.map(|v| v.to_rfc3339()).unwrap_or_default(),
        ])
    }

    /// No native `updated_at`; `granted_at` is the LWW clock (spec.md §3).
    fn lww_timestamp(&self) -> DateTime<Utc> {
        self.granted_at
    }

    async fn list_local(store: &Store) -> ClusterResult<Vec<Self>> {
        store.list_active_bucket_permissions().await
    }

    async fn get_local(store: &Store, id: &str) -> ClusterResult<Option<Self>> {
        match Uuid::parse_str(id) {
            Ok(id) => store.get_bucket_permission(id).await,
            Err(_) => Ok(None),
        }
    }

    async fn upsert(store: &Store, entity: &Self) -> ClusterResult<()> {
        store.upsert_bucket_permission(entity).await
    }
}

#[async_trait]
impl SyncableEntity for IdpProvider {
    const ENTITY_TYPE: EntityType = EntityType::IdpProvider;

    fn id_string(&self) -> String {
        self.id.to_string()
    }

    fn checksum(&self) -> String {
        canonical_checksum(&[
            &self.name,
            &self.provider_type,
            &self.tenant_id.map(|v| v.to_string()).unwrap_or_default(),
            &self.status,
            &self.config_json,
            &self.updated_at.to_rfc3339(),
        ])
    }

    fn lww_timestamp(&self) -> DateTime<Utc> {
        self.updated_at
    }

    async fn list_local(store: &Store) -> ClusterResult<Vec<Self>> {
        store.list_active_idp_providers().await
    }

    async fn get_local(store: &Store, id: &str) -> ClusterResult<Option<Self>> {
        match Uuid::parse_str(id) {
            Ok(id) => store.get_idp_provider(id).await,
            Err(_) => Ok(None),
        }
    }

    async fn upsert(store: &Store, entity: &Self) -> ClusterResult<()> {
        store.upsert_idp_provider(entity).await
    }
}

#[async_trait]
impl SyncableEntity for GroupMapping {
    const ENTITY_TYPE: EntityType = EntityType::GroupMapping;

    fn id_string(&self) -> String {
        self.id.to_string()
    }

    fn checksum(&self) -> String {
        canonical_checksum(&[
            &self.provider_id.to_string(),
            &self.external_group,
            &self.role,
            &self.tenant_id.map(|v| v.to_string()).unwrap_or_default(),
            &self.auto_sync.to_string(),
            &self.updated_at.to_rfc3339(),
        ])
    }

    fn lww_timestamp(&self) -> DateTime<Utc> {
        self.updated_at
    }

    async fn list_local(store: &Store) -> ClusterResult<Vec<Self>> {
        store.list_active_group_mappings().await
    }

    async fn get_local(store: &Store, id: &str) -> ClusterResult<Option<Self>> {
        match Uuid::parse_str(id) {
            Ok(id) => store.get_group_mapping(id).await,
            Err(_) => Ok(None),
        }
    }

    async fn upsert(store: &Store, entity: &Self) -> ClusterResult<()> {
        store.upsert_group_mapping(entity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sync::receive_push;
    use chrono::Duration;

    #[tokio::test]
    async fn lww_drops_push_older_than_local() {
        let store = Store::connect_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let local = Tenant {
            id,
            name: "acme".into(),
            display_name: "Acme".into(),
            status: "active".into(),
            quota_bytes: None,
            quota_objects: None,
            metadata_json: "{}".into(),
            created_at: now - Duration::days(1),
            updated_at: now,
        };
        store.upsert_tenant(&local).await.unwrap();

        let mut stale = local.clone();
        stale.display_name = "Stale Name".into();
        stale.updated_at = now - Duration::seconds(50);

        let applied = receive_push(&store, stale).await.unwrap();
        assert!(!applied);

        let reloaded = store.get_tenant(id).await.unwrap().unwrap();
        assert_eq!(reloaded.display_name, "Acme");
    }

    #[tokio::test]
    async fn lww_applies_push_newer_than_local() {
        let store = Store::connect_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let local = Tenant {
            id,
            name: "acme".into(),
            display_name: "Acme".into(),
            status: "active".into(),
            quota_bytes: None,
            quota_objects: None,
            metadata_json: "{}".into(),
            created_at: now - Duration::days(1),
            updated_at: now,
        };
        store.upsert_tenant(&local).await.unwrap();

        let mut fresh = local.clone();
        fresh.display_name = "Acme Renamed".into();
        fresh.updated_at = now + Duration::seconds(10);

        let applied = receive_push(&store, fresh).await.unwrap();
        assert!(applied);

        let reloaded = store.get_tenant(id).await.unwrap().unwrap();
        assert_eq!(reloaded.display_name, "Acme Renamed");
    }
}
