// src/core/model.rs

//! The cluster-wide data model: nodes, entity records, tombstones, and the
//! bookkeeping rows that back last-writer-wins synchronization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Health as observed by the local health checker (C5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
    #[default]
    Unknown,
    Removed,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unavailable => "unavailable",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Removed => "removed",
        }
    }
}

impl std::str::FromStr for HealthStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "healthy" => HealthStatus::Healthy,
            "degraded" => HealthStatus::Degraded,
            "unavailable" => HealthStatus::Unavailable,
            "removed" => HealthStatus::Removed,
            _ => HealthStatus::Unknown,
        })
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and liveness record for a cluster member (spec.md §3 `Node`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub endpoint: String,
    pub node_token: String,
    pub region: String,
    pub priority: i32,
    pub health_status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
    pub capacity_bytes: Option<i64>,
    pub used_bytes: Option<i64>,
    pub is_stale: bool,
    pub last_local_write_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl Node {
    /// `is_stale = true` must imply `(now - last_seen) >= threshold`, or that the
    /// node was never seen at all (invariant 4, spec.md §8).
    pub fn staleness_is_consistent(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        if !self.is_stale {
            return true;
        }
        match self.last_seen {
            None => true,
            Some(seen) => now - seen >= threshold,
        }
    }

    /// Whether this node accepted writes while isolated (`last_local_write_at`
    /// is set). Determines offline vs. partition reconcile mode (spec.md §4.6).
    pub fn reconcile_mode(&self) -> ReconcileMode {
        match self.last_local_write_at {
            Some(_) => ReconcileMode::Partition,
            None => ReconcileMode::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    Offline,
    Partition,
}

/// Singleton cluster identity/config row (spec.md §3 `ClusterConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: Uuid,
    pub node_name: String,
    pub cluster_token: String,
    pub is_cluster_enabled: bool,
    pub region: String,
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    pub node_cert_pem: String,
    pub node_key_pem: String,
}

/// The six replicated entity kinds, used as table/endpoint discriminants.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    Tenant,
    User,
    AccessKey,
    BucketPermission,
    IdpProvider,
    GroupMapping,
}

impl EntityType {
    /// Path segment used for `/{entity}-sync` and `/{entity}-delete-sync`.
    pub fn path_segment(self) -> &'static str {
        match self {
            EntityType::Tenant => "tenant",
            EntityType::User => "user",
            EntityType::AccessKey => "access-key",
            EntityType::BucketPermission => "bucket-permission",
            EntityType::IdpProvider => "idp-provider",
            EntityType::GroupMapping => "group-mapping",
        }
    }

    /// Entity types without a native `updated_at` clock: tombstones always
    /// win against them (spec.md §7, §9 Open Questions).
    pub fn has_lww_clock(self) -> bool {
        !matches!(
            self,
            EntityType::AccessKey | EntityType::BucketPermission
        )
    }

    /// snake_case segment used in persistent config keys (spec.md §6.4:
    /// `auto_{entity}_sync_enabled`, `{entity}_sync_interval_seconds`).
    pub fn config_key_segment(self) -> &'static str {
        match self {
            EntityType::Tenant => "tenant",
            EntityType::User => "user",
            EntityType::AccessKey => "access_key",
            EntityType::BucketPermission => "bucket_permission",
            EntityType::IdpProvider => "idp_provider",
            EntityType::GroupMapping => "group_mapping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub status: String,
    pub quota_bytes: Option<i64>,
    pub quota_objects: Option<i64>,
    pub metadata_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub status: String,
    pub tenant_id: Option<Uuid>,
    pub roles_json: String,
    pub policies_json: String,
    pub auth_provider: Option<String>,
    pub auth_provider_subject: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccessKey {
    pub access_key_id: String,
    pub secret: String,
    pub user_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BucketPermission {
    pub id: Uuid,
    pub bucket: String,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub permission: String,
    pub grantor: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdpProvider {
    pub id: Uuid,
    pub name: String,
    pub provider_type: String,
    pub tenant_id: Option<Uuid>,
    pub status: String,
    pub config_json: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupMapping {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub external_group: String,
    pub role: String,
    pub tenant_id: Option<Uuid>,
    pub auto_sync: bool,
    pub updated_at: DateTime<Utc>,
}

/// A durable deletion tombstone (spec.md §3 `DeletionEntry`).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeletionEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub deleted_by_node_id: Uuid,
    pub deleted_at: DateTime<Utc>,
}

/// Per-(entity, destination) sync bookkeeping row (spec.md §3 `SyncState`).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncStateRow {
    pub entity_id: String,
    pub destination_node_id: Uuid,
    pub checksum: String,
    pub last_sync_at: DateTime<Utc>,
}

/// A lightweight (id, updated_at) stamp used by the state-snapshot service
/// (C7) and consumed by the stale reconciler (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityStamp {
    pub id: String,
    pub updated_at: DateTime<Utc>,
}

/// Full structural snapshot returned by `GET /api/internal/cluster/state-snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub node_id: Uuid,
    pub snapshot_at: i64,
    pub tenants: Vec<EntityStamp>,
    pub users: Vec<EntityStamp>,
    pub access_keys: Vec<EntityStamp>,
    pub bucket_permissions: Vec<EntityStamp>,
    pub idp_providers: Vec<EntityStamp>,
    pub group_mappings: Vec<EntityStamp>,
    pub tombstones: Vec<DeletionEntry>,
}

/// A row in the data-plane's object-replication queue. Carried here only as
/// a schema/shape placeholder (spec.md §3 `ReplicationQueueItem`) — the
/// worker that drains it lives in the data plane, out of scope (§1).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReplicationQueueItem {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub source_bucket: String,
    pub object_key: String,
    pub dest_node_id: Uuid,
    pub dest_bucket: String,
    pub operation: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A bucket-migration job row (spec.md §3 `MigrationJob`), schema placeholder
/// for the external migration codepath (§1, §6).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MigrationJob {
    pub id: Uuid,
    pub bucket: String,
    pub source_node: Uuid,
    pub target_node: Uuid,
    pub status: String,
    pub objects_total: i64,
    pub objects_migrated: i64,
    pub bytes_total: i64,
    pub bytes_migrated: i64,
    pub verify_data: bool,
    pub delete_source: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// `cluster_health_history` row appended by every probe (spec.md §4.5).
/// Built manually in `store` rather than via `#[derive(FromRow)]` because
/// `HealthStatus` round-trips through a plain `TEXT` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthHistoryEntry {
    pub id: i64,
    pub node_id: Uuid,
    pub status: HealthStatus,
    pub latency_ms: Option<i64>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
