// src/core/store/entities.rs

//! Per-entity CRUD for the six replicated catalog tables. Each block is
//! structurally identical (list-active, get-by-id, upsert-by-id) — the
//! duplication here is the canonical-fields explicitness the design notes
//! (spec.md §9) call for: the checksum and row-shape per entity type must
//! stay visible at the call site, not hidden behind a generic mapper.

use super::Store;
use crate::core::errors::ClusterResult;
use crate::core::model::*;
use chrono::Utc;
use uuid::Uuid;

impl Store {
    // ---- Tenant -----------------------------------------------------

    pub async fn list_active_tenants(&self) -> ClusterResult<Vec<Tenant>> {
        let rows = sqlx::query_as::<_, Tenant>(
            "SELECT id, name, display_name, status, quota_bytes, quota_objects, metadata_json, \
             created_at, updated_at FROM cluster_tenants WHERE status != 'deleted'",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_tenant(&self, id: Uuid) -> ClusterResult<Option<Tenant>> {
        let row = sqlx::query_as::<_, Tenant>(
            "SELECT id, name, display_name, status, quota_bytes, quota_objects, metadata_json, \
             created_at, updated_at FROM cluster_tenants WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Upsert honoring LWW: the caller (the receive-side handler) has
    /// already decided the incoming record should win; this just persists
    /// it unconditionally, bumping nothing — `updated_at` travels with the
    /// record itself per spec.md §4.4 "Receive side".
    pub async fn upsert_tenant(&self, t: &Tenant) -> ClusterResult<()> {
        sqlx::query(
            "INSERT INTO cluster_tenants (id, name, display_name, status, quota_bytes, \
             quota_objects, metadata_json, created_at, updated_at) VALUES (?,?,?,?,?,?,?,?,?) \
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, display_name=excluded.display_name, \
             status=excluded.status, quota_bytes=excluded.quota_bytes, \
             quota_objects=excluded.quota_objects, metadata_json=excluded.metadata_json, \
             updated_at=excluded.updated_at",
        )
        .bind(t.id.to_string())
        .bind(&t.name)
        .bind(&t.display_name)
        .bind(&t.status)
        .bind(t.quota_bytes)
        .bind(t.quota_objects)
        .bind(&t.metadata_json)
        .bind(t.created_at.to_rfc3339())
        .bind(t.updated_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Local mutator: bumps `updated_at = now` and records a tombstone on
    /// delete, per spec.md §4.2.
    pub async fn delete_tenant_locally(&self, id: Uuid, by_node: Uuid) -> ClusterResult<()> {
        sqlx::query("UPDATE cluster_tenants SET status = 'deleted', updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        self.record_deletion(&DeletionEntry {
            id: Uuid::new_v4(),
            entity_type: EntityType::Tenant.to_string(),
            entity_id: id.to_string(),
            deleted_by_node_id: by_node,
            deleted_at: Utc::now(),
        })
        .await
    }

    // ---- User ---------------------------------------------------------

    pub async fn list_active_users(&self) -> ClusterResult<Vec<User>> {
        let rows = sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, status, tenant_id, roles_json, policies_json, \
             auth_provider, auth_provider_subject, updated_at FROM cluster_users WHERE status != 'deleted'",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_user(&self, id: Uuid) -> ClusterResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, status, tenant_id, roles_json, policies_json, \
             auth_provider, auth_provider_subject, updated_at FROM cluster_users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn upsert_user(&self, u: &User) -> ClusterResult<()> {
        sqlx::query(
            "INSERT INTO cluster_users (id, username, password_hash, status, tenant_id, \
             roles_json, policies_json, auth_provider, auth_provider_subject, updated_at) \
             VALUES (?,?,?,?,?,?,?,?,?,?) \
             ON CONFLICT(id) DO UPDATE SET username=excluded.username, \
             password_hash=excluded.password_hash, status=excluded.status, \
             tenant_id=excluded.tenant_id, roles_json=excluded.roles_json, \
             policies_json=excluded.policies_json, auth_provider=excluded.auth_provider, \
             auth_provider_subject=excluded.auth_provider_subject, updated_at=excluded.updated_at",
        )
        .bind(u.id.to_string())
        .bind(&u.username)
        .bind(&u.password_hash)
        .bind(&u.status)
        .bind(u.tenant_id.map(|t| t.to_string()))
        .bind(&u.roles_json)
        .bind(&u.policies_json)
        .bind(&u.auth_provider)
        .bind(&u.auth_provider_subject)
        .bind(u.updated_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_user_locally(&self, id: Uuid, by_node: Uuid) -> ClusterResult<()> {
        sqlx::query("UPDATE cluster_users SET status = 'deleted', updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        self.record_deletion(&DeletionEntry {
            id: Uuid::new_v4(),
            entity_type: EntityType::User.to_string(),
            entity_id: id.to_string(),
            deleted_by_node_id: by_node,
            deleted_at: Utc::now(),
        })
        .await
    }

    // ---- AccessKey ------------------------------------------------------

    pub async fn list_active_access_keys(&self) -> ClusterResult<Vec<AccessKey>> {
        let rows = sqlx::query_as::<_, AccessKey>(
            "SELECT access_key_id, secret, user_id, status, created_at FROM cluster_access_keys \
             WHERE status = 'active'",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_access_key(&self, id: &str) -> ClusterResult<Option<AccessKey>> {
        let row = sqlx::query_as::<_, AccessKey>(
            "SELECT access_key_id, secret, user_id, status, created_at FROM cluster_access_keys \
             WHERE access_key_id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn upsert_access_key(&self, k: &AccessKey) -> ClusterResult<()> {
        sqlx::query(
            "INSERT INTO cluster_access_keys (access_key_id, secret, user_id, status, created_at) \
             VALUES (?,?,?,?,?) ON CONFLICT(access_key_id) DO UPDATE SET secret=excluded.secret, \
             user_id=excluded.user_id, status=excluded.status, created_at=excluded.created_at",
        )
        .bind(&k.access_key_id)
        .bind(&k.secret)
        .bind(k.user_id.to_string())
        .bind(&k.status)
        .bind(k.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_access_key_locally(&self, id: &str, by_node: Uuid) -> ClusterResult<()> {
        sqlx::query("UPDATE cluster_access_keys SET status = 'deleted' WHERE access_key_id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        self.record_deletion(&DeletionEntry {
            id: Uuid::new_v4(),
            entity_type: EntityType::AccessKey.to_string(),
            entity_id: id.to_string(),
            deleted_by_node_id: by_node,
            deleted_at: Utc::now(),
        })
        .await
    }

    // ---- BucketPermission -----------------------------------------------

    pub async fn list_active_bucket_permissions(&self) -> ClusterResult<Vec<BucketPermission>> {
        let rows = sqlx::query_as::<_, BucketPermission>(
            "SELECT id, bucket, user_id, tenant_id, permission, grantor, granted_at, expires_at \
             FROM cluster_bucket_permissions",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_bucket_permission(&self, id: Uuid) -> ClusterResult<Option<BucketPermission>> {
        let row = sqlx::query_as::<_, BucketPermission>(
            "SELECT id, bucket, user_id, tenant_id, permission, grantor, granted_at, expires_at \
             FROM cluster_bucket_permissions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn upsert_bucket_permission(&self, p: &BucketPermission) -> ClusterResult<()> {
        sqlx::query(
            "INSERT INTO cluster_bucket_permissions (id, bucket, user_id, tenant_id, permission, \
             grantor, granted_at, expires_at) VALUES (?,?,?,?,?,?,?,?) \
             ON CONFLICT(id) DO UPDATE SET bucket=excluded.bucket, user_id=excluded.user_id, \
             tenant_id=excluded.tenant_id, permission=excluded.permission, \
             grantor=excluded.grantor, granted_at=excluded.granted_at, expires_at=excluded.expires_at",
        )
        .bind(p.id.to_string())
        .bind(&p.bucket)
        .bind(p.user_id.map(|u| u.to_string()))
        .bind(p.tenant_id.map(|t| t.to_string()))
        .bind(&p.permission)
        .bind(&p.grantor)
        .bind(p.granted_at.to_rfc3339())
        .bind(p.expires_at.map(|e| e.to_rfc3339()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_bucket_permission_locally(&self, id: Uuid, by_node: Uuid) -> ClusterResult<()> {
        sqlx::query("DELETE FROM cluster_bucket_permissions WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        self.record_deletion(&DeletionEntry {
            id: Uuid::new_v4(),
            entity_type: EntityType::BucketPermission.to_string(),
            entity_id: id.to_string(),
            deleted_by_node_id: by_node,
            deleted_at: Utc::now(),
        })
        .await
    }

    // ---- IdpProvider ------------------------------------------------------

    pub async fn list_active_idp_providers(&self) -> ClusterResult<Vec<IdpProvider>> {
        let rows = sqlx::query_as::<_, IdpProvider>(
            "SELECT id, name, provider_type, tenant_id, status, config_json, updated_at \
             FROM cluster_idp_providers WHERE status != 'deleted'",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_idp_provider(&self, id: Uuid) -> ClusterResult<Option<IdpProvider>> {
        let row = sqlx::query_as::<_, IdpProvider>(
            "SELECT id, name, provider_type, tenant_id, status, config_json, updated_at \
             FROM cluster_idp_providers WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn upsert_idp_provider(&self, p: &IdpProvider) -> ClusterResult<()> {
        sqlx::query(
            "INSERT INTO cluster_idp_providers (id, name, provider_type, tenant_id, status, \
             config_json, updated_at) VALUES (?,?,?,?,?,?,?) \
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, provider_type=excluded.provider_type, \
             tenant_id=excluded.tenant_id, status=excluded.status, config_json=excluded.config_json, \
             updated_at=excluded.updated_at",
        )
        .bind(p.id.to_string())
        .bind(&p.name)
        .bind(&p.provider_type)
        .bind(p.tenant_id.map(|t| t.to_string()))
        .bind(&p.status)
        .bind(&p.config_json)
        .bind(p.updated_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_idp_provider_locally(&self, id: Uuid, by_node: Uuid) -> ClusterResult<()> {
        sqlx::query("UPDATE cluster_idp_providers SET status = 'deleted', updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        self.record_deletion(&DeletionEntry {
            id: Uuid::new_v4(),
            entity_type: EntityType::IdpProvider.to_string(),
            entity_id: id.to_string(),
            deleted_by_node_id: by_node,
            deleted_at: Utc::now(),
        })
        .await
    }

    // ---- GroupMapping -----------------------------------------------------

    pub async fn list_active_group_mappings(&self) -> ClusterResult<Vec<GroupMapping>> {
        let rows = sqlx::query_as::<_, GroupMapping>(
            "SELECT id, provider_id, external_group, role, tenant_id, auto_sync, updated_at \
             FROM cluster_group_mappings",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_group_mapping(&self, id: Uuid) -> ClusterResult<Option<GroupMapping>> {
        let row = sqlx::query_as::<_, GroupMapping>(
            "SELECT id, provider_id, external_group, role, tenant_id, auto_sync, updated_at \
             FROM cluster_group_mappings WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn upsert_group_mapping(&self, g: &GroupMapping) -> ClusterResult<()> {
        sqlx::query(
            "INSERT INTO cluster_group_mappings (id, provider_id, external_group, role, \
             tenant_id, auto_sync, updated_at) VALUES (?,?,?,?,?,?,?) \
             ON CONFLICT(id) DO UPDATE SET provider_id=excluded.provider_id, \
             external_group=excluded.external_group, role=excluded.role, \
             tenant_id=excluded.tenant_id, auto_sync=excluded.auto_sync, updated_at=excluded.updated_at",
        )
        .bind(g.id.to_string())
        .bind(g.provider_id.to_string())
        .bind(&g.external_group)
        .bind(&g.role)
        .bind(g.tenant_id.map(|t| t.to_string()))
        .bind(g.auto_sync as i64)
        .bind(g.updated_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_group_mapping_locally(&self, id: Uuid, by_node: Uuid) -> ClusterResult<()> {
        sqlx::query("DELETE FROM cluster_group_mappings WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        self.record_deletion(&DeletionEntry {
            id: Uuid::new_v4(),
            entity_type: EntityType::GroupMapping.to_string(),
            entity_id: id.to_string(),
            deleted_by_node_id: by_node,
            deleted_at: Utc::now(),
        })
        .await
    }

    // ---- Cross-entity receive-side deletion ------------------------------

    /// Applies a tombstone's effect to the local row for `entity_type`
    /// without touching the deletion log itself — used by
    /// `deletion_log::apply_incoming_tombstone`, which records the
    /// tombstone separately with the *incoming* `deleted_at` rather than
    /// `now()`. Unlike `delete_{entity}_locally` (the admin-initiated path),
    /// this never fails if the row is already gone: receiving a tombstone
    /// for an entity this node never had is a no-op, not an error.
    pub async fn apply_remote_deletion_to_row(&self, entity_type: EntityType, entity_id: &str) -> ClusterResult<()> {
        match entity_type {
            EntityType::Tenant => {
                sqlx::query("UPDATE cluster_tenants SET status = 'deleted', updated_at = ? WHERE id = ?")
                    .bind(Utc::now().to_rfc3339())
                    .bind(entity_id)
                    .execute(self.pool())
                    .await?;
            }
            EntityType::User => {
                sqlx::query("UPDATE cluster_users SET status = 'deleted', updated_at = ? WHERE id = ?")
                    .bind(Utc::now().to_rfc3339())
                    .bind(entity_id)
                    .execute(self.pool())
                    .await?;
            }
            EntityType::AccessKey => {
                sqlx::query("UPDATE cluster_access_keys SET status = 'deleted' WHERE access_key_id = ?")
                    .bind(entity_id)
                    .execute(self.pool())
                    .await?;
            }
            EntityType::BucketPermission => {
                sqlx::query("DELETE FROM cluster_bucket_permissions WHERE id = ?")
                    .bind(entity_id)
                    .execute(self.pool())
                    .await?;
            }
            EntityType::IdpProvider => {
                sqlx::query("UPDATE cluster_idp_providers SET status = 'deleted', updated_at = ? WHERE id = ?")
                    .bind(Utc::now().to_rfc3339())
                    .bind(entity_id)
                    .execute(self.pool())
                    .await?;
            }
            EntityType::GroupMapping => {
                sqlx::query("DELETE FROM cluster_group_mappings WHERE id = ?")
                    .bind(entity_id)
                    .execute(self.pool())
                    .await?;
            }
        }
        Ok(())
    }
}
