// src/core/store/mod.rs

//! The durable store abstraction (C1): typed CRUD over the per-node
//! database, with transactional upsert-by-conflict-key writes.

mod entities;
mod schema;

pub use schema::{init_replication_schema, init_schema};

use crate::core::errors::{ClusterError, ClusterResult};
use crate::core::model::*;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Owns the connection pool and exposes every typed accessor the rest of the
/// control plane needs. A single `Store` is shared (via `Arc`) across every
/// background task, mirroring how the teacher threads its database handle
/// through `ServerState`.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> ClusterResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await?;
        init_schema(&pool).await?;
        init_replication_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// A throwaway in-process database, used by unit tests and by the
    /// `tests/` integration scenarios — kept public (not `cfg(test)`-gated)
    /// so external test binaries can reach it too.
    pub async fn connect_in_memory() -> ClusterResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- cluster_config -------------------------------------------------

    pub async fn get_cluster_config(&self) -> ClusterResult<Option<ClusterConfig>> {
        let row = sqlx::query_as::<_, (
            String, String, String, i64, String, String, String, String, String,
        )>(
            "SELECT node_id, node_name, cluster_token, is_cluster_enabled, region, \
             ca_cert_pem, ca_key_pem, node_cert_pem, node_key_pem FROM cluster_config LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => None,
            Some((node_id, node_name, cluster_token, enabled, region, ca_cert, ca_key, node_cert, node_key)) => {
                Some(ClusterConfig {
                    node_id: Uuid::parse_str(&node_id)?,
                    node_name,
                    cluster_token,
                    is_cluster_enabled: enabled != 0,
                    region,
                    ca_cert_pem: ca_cert,
                    ca_key_pem: ca_key,
                    node_cert_pem: node_cert,
                    node_key_pem: node_key,
                })
            }
        })
    }

    /// Replaces the single `cluster_config` row. Called by both
    /// `InitializeCluster` and `JoinCluster` (the latter overwrites any
    /// prior row, per spec.md §4.11).
    pub async fn put_cluster_config(&self, cfg: &ClusterConfig) -> ClusterResult<()> {
        sqlx::query("DELETE FROM cluster_config")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO cluster_config (node_id, node_name, cluster_token, is_cluster_enabled, \
             region, ca_cert_pem, ca_key_pem, node_cert_pem, node_key_pem) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(cfg.node_id.to_string())
        .bind(&cfg.node_name)
        .bind(&cfg.cluster_token)
        .bind(cfg.is_cluster_enabled as i64)
        .bind(&cfg.region)
        .bind(&cfg.ca_cert_pem)
        .bind(&cfg.ca_key_pem)
        .bind(&cfg.node_cert_pem)
        .bind(&cfg.node_key_pem)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_cluster_enabled(&self, enabled: bool) -> ClusterResult<()> {
        sqlx::query("UPDATE cluster_config SET is_cluster_enabled = ?")
            .bind(enabled as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- cluster_nodes ----------------------------------------------------

    pub async fn upsert_node(&self, node: &Node) -> ClusterResult<()> {
        let metadata_json = serde_json::to_string(&node.metadata)?;
        sqlx::query(
            "INSERT INTO cluster_nodes (id, name, endpoint, node_token, region, priority, \
             health_status, last_health_check, last_seen, latency_ms, capacity_bytes, used_bytes, \
             is_stale, last_local_write_at, metadata_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               name = excluded.name, endpoint = excluded.endpoint, node_token = excluded.node_token, \
               region = excluded.region, priority = excluded.priority, \
               health_status = excluded.health_status, last_health_check = excluded.last_health_check, \
               last_seen = excluded.last_seen, latency_ms = excluded.latency_ms, \
               capacity_bytes = excluded.capacity_bytes, used_bytes = excluded.used_bytes, \
               is_stale = excluded.is_stale, last_local_write_at = excluded.last_local_write_at, \
               metadata_json = excluded.metadata_json",
        )
        .bind(node.id.to_string())
        .bind(&node.name)
        .bind(&node.endpoint)
        .bind(&node.node_token)
        .bind(&node.region)
        .bind(node.priority)
        .bind(node.health_status.as_str())
        .bind(node.last_health_check.map(|t| t.to_rfc3339()))
        .bind(node.last_seen.map(|t| t.to_rfc3339()))
        .bind(node.latency_ms)
        .bind(node.capacity_bytes)
        .bind(node.used_bytes)
        .bind(node.is_stale as i64)
        .bind(node.last_local_write_at.map(|t| t.to_rfc3339()))
        .bind(metadata_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_node(&self, id: Uuid) -> ClusterResult<Option<Node>> {
        let row = sqlx::query(
            "SELECT id, name, endpoint, node_token, region, priority, health_status, \
             last_health_check, last_seen, latency_ms, capacity_bytes, used_bytes, is_stale, \
             last_local_write_at, metadata_json FROM cluster_nodes WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_node(r)).transpose()
    }

    pub async fn list_nodes(&self) -> ClusterResult<Vec<Node>> {
        let rows = sqlx::query(
            "SELECT id, name, endpoint, node_token, region, priority, health_status, \
             last_health_check, last_seen, latency_ms, capacity_bytes, used_bytes, is_stale, \
             last_local_write_at, metadata_json FROM cluster_nodes WHERE health_status != 'removed'",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_node).collect()
    }

    /// Nodes other than `self_id` whose `health_status` is healthy or
    /// degraded (degraded peers still get pushed to, only `unavailable`
    /// peers are excluded from a sync tick — spec.md §4.4 step 2).
    pub async fn list_healthy_peers(&self, self_id: Uuid) -> ClusterResult<Vec<Node>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.id != self_id)
            .filter(|n| matches!(n.health_status, HealthStatus::Healthy | HealthStatus::Degraded))
            .collect())
    }

    pub async fn remove_node(&self, id: Uuid) -> ClusterResult<()> {
        sqlx::query("UPDATE cluster_nodes SET health_status = 'removed' WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn append_health_history(&self, entry: &HealthHistoryEntry) -> ClusterResult<()> {
        sqlx::query(
            "INSERT INTO cluster_health_history (node_id, status, latency_ms, error_message, recorded_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.node_id.to_string())
        .bind(entry.status.as_str())
        .bind(entry.latency_ms)
        .bind(&entry.error_message)
        .bind(entry.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cleanup_health_history(&self, retention_days: i64) -> ClusterResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let res = sqlx::query("DELETE FROM cluster_health_history WHERE recorded_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// All retained probe history for one node, most recent first —
    /// the admin-tooling counterpart to `append_health_history`.
    pub async fn list_health_history(&self, node_id: Uuid) -> ClusterResult<Vec<HealthHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, node_id, status, latency_ms, error_message, recorded_at \
             FROM cluster_health_history WHERE node_id = ? ORDER BY recorded_at DESC",
        )
        .bind(node_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_health_history).collect()
    }

    // ---- cluster_global_config -------------------------------------------

    pub async fn get_config_value(&self, key: &str) -> ClusterResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM cluster_global_config WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_config_value(&self, key: &str, value: &str) -> ClusterResult<()> {
        sqlx::query(
            "INSERT INTO cluster_global_config (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- sync state (per entity type) ------------------------------------

    fn sync_table(entity_type: EntityType) -> &'static str {
        match entity_type {
            EntityType::Tenant => "cluster_sync_tenant",
            EntityType::User => "cluster_sync_user",
            EntityType::AccessKey => "cluster_sync_access_key",
            EntityType::BucketPermission => "cluster_sync_bucket_permission",
            EntityType::IdpProvider => "cluster_sync_idp_provider",
            EntityType::GroupMapping => "cluster_sync_group_mapping",
        }
    }

    pub async fn get_sync_checksum(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        destination_node_id: Uuid,
    ) -> ClusterResult<Option<String>> {
        let table = Self::sync_table(entity_type);
        let sql = format!(
            "SELECT checksum FROM {table} WHERE entity_id = ? AND destination_node_id = ?"
        );
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(entity_id)
            .bind(destination_node_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(c,)| c))
    }

    /// Upsert on conflict of the (entity_id, destination_node_id) key
    /// (spec.md §3 invariant, §8 property 6: calling this twice with
    /// different checksums leaves exactly one row holding the second one).
    pub async fn update_sync_status(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        destination_node_id: Uuid,
        checksum: &str,
    ) -> ClusterResult<()> {
        let table = Self::sync_table(entity_type);
        let sql = format!(
            "INSERT INTO {table} (entity_id, destination_node_id, checksum, last_sync_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(entity_id, destination_node_id) DO UPDATE SET \
               checksum = excluded.checksum, last_sync_at = excluded.last_sync_at"
        );
        sqlx::query(&sql)
            .bind(entity_id)
            .bind(destination_node_id.to_string())
            .bind(checksum)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- deletion_log -------------------------------------------------

    pub async fn record_deletion(&self, entry: &DeletionEntry) -> ClusterResult<()> {
        sqlx::query(
            "INSERT INTO cluster_deletion_log (id, entity_type, entity_id, deleted_by_node_id, deleted_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET \
               deleted_by_node_id = excluded.deleted_by_node_id, deleted_at = excluded.deleted_at",
        )
        .bind(entry.id.to_string())
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.deleted_by_node_id.to_string())
        .bind(entry.deleted_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_deletions(&self, entity_type: EntityType) -> ClusterResult<Vec<DeletionEntry>> {
        let rows = sqlx::query_as::<_, DeletionEntry>(
            "SELECT id, entity_type, entity_id, deleted_by_node_id, deleted_at \
             FROM cluster_deletion_log WHERE entity_type = ?",
        )
        .bind(entity_type.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_all_deletions(&self) -> ClusterResult<Vec<DeletionEntry>> {
        let rows = sqlx::query_as::<_, DeletionEntry>(
            "SELECT id, entity_type, entity_id, deleted_by_node_id, deleted_at FROM cluster_deletion_log",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn has_deletion(&self, entity_type: EntityType, entity_id: &str) -> ClusterResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM cluster_deletion_log WHERE entity_type = ? AND entity_id = ? LIMIT 1",
        )
        .bind(entity_type.to_string())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn cleanup_old_deletions(&self, max_age: chrono::Duration) -> ClusterResult<u64> {
        let cutoff = Utc::now() - max_age;
        let res = sqlx::query("DELETE FROM cluster_deletion_log WHERE deleted_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // ---- bucket location cache persistence (optional durability) --------

    pub async fn cache_bucket_location(&self, bucket: &str, node_id: Uuid, expires_at: chrono::DateTime<Utc>) -> ClusterResult<()> {
        sqlx::query(
            "INSERT INTO cluster_bucket_location_cache (bucket, node_id, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(bucket) DO UPDATE SET node_id = excluded.node_id, expires_at = excluded.expires_at",
        )
        .bind(bucket)
        .bind(node_id.to_string())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn invalidate_bucket_location(&self, bucket: &str) -> ClusterResult<()> {
        sqlx::query("DELETE FROM cluster_bucket_location_cache WHERE bucket = ?")
            .bind(bucket)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Loads a persisted cache entry, e.g. to warm the in-memory router
    /// cache after a restart. Returns `None` once `expires_at` has passed.
    pub async fn get_cached_bucket_location(&self, bucket: &str) -> ClusterResult<Option<(Uuid, chrono::DateTime<Utc>)>> {
        use sqlx::Row;
        let row = sqlx::query("SELECT node_id, expires_at FROM cluster_bucket_location_cache WHERE bucket = ?")
            .bind(bucket)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let node_id: String = row.try_get("node_id")?;
        let expires_at: String = row.try_get("expires_at")?;
        let node_id = Uuid::parse_str(&node_id).map_err(|e| ClusterError::Internal(e.to_string()))?;
        let expires_at = chrono::DateTime::parse_from_rfc3339(&expires_at)
            .map_err(|e| ClusterError::Internal(e.to_string()))?
            .with_timezone(&Utc);
        if expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some((node_id, expires_at)))
    }
}

fn row_to_node(row: sqlx::sqlite::SqliteRow) -> ClusterResult<Node> {
    use sqlx::Row;
    let id: String = row.try_get("id")?;
    let last_health_check: Option<String> = row.try_get("last_health_check")?;
    let last_seen: Option<String> = row.try_get("last_seen")?;
    let last_local_write_at: Option<String> = row.try_get("last_local_write_at")?;
    let health_status: String = row.try_get("health_status")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let metadata: HashMap<String, String> =
        serde_json::from_str(&metadata_json).unwrap_or_default();

    Ok(Node {
        id: Uuid::parse_str(&id).map_err(|e| ClusterError::Internal(e.to_string()))?,
        name: row.try_get("name")?,
        endpoint: row.try_get("endpoint")?,
        node_token: row.try_get("node_token")?,
        region: row.try_get("region")?,
        priority: row.try_get("priority")?,
        health_status: HealthStatus::from_str(&health_status).unwrap_or_default(),
        last_health_check: parse_rfc3339(last_health_check),
        last_seen: parse_rfc3339(last_seen),
        latency_ms: row.try_get("latency_ms")?,
        capacity_bytes: row.try_get("capacity_bytes")?,
        used_bytes: row.try_get("used_bytes")?,
        is_stale: row.try_get::<i64, _>("is_stale")? != 0,
        last_local_write_at: parse_rfc3339(last_local_write_at),
        metadata,
    })
}

fn row_to_health_history(row: sqlx::sqlite::SqliteRow) -> ClusterResult<HealthHistoryEntry> {
    use sqlx::Row;
    let node_id: String = row.try_get("node_id")?;
    let status: String = row.try_get("status")?;
    let recorded_at: String = row.try_get("recorded_at")?;
    Ok(HealthHistoryEntry {
        id: row.try_get("id")?,
        node_id: Uuid::parse_str(&node_id).map_err(|e| ClusterError::Internal(e.to_string()))?,
        status: HealthStatus::from_str(&status).unwrap_or_default(),
        latency_ms: row.try_get("latency_ms")?,
        error_message: row.try_get("error_message")?,
        recorded_at: chrono::DateTime::parse_from_rfc3339(&recorded_at)
            .map_err(|e| ClusterError::Internal(e.to_string()))?
            .with_timezone(&Utc),
    })
}

fn parse_rfc3339(v: Option<String>) -> Option<chrono::DateTime<Utc>> {
    v.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
