// src/core/store/schema.rs

//! Idempotent schema initialization for the per-node catalog database.
//!
//! Mirrors the teacher's `InitSchema`/`InitReplicationSchema` split: one
//! function for the cluster catalog tables, one for the object-replication
//! placeholders that belong to the data plane's schema but are declared here
//! because the control plane and data plane share one SQLite file.

use sqlx::SqlitePool;

/// Creates every table the control plane needs, using
/// `CREATE TABLE IF NOT EXISTS` so startup is safe to repeat (spec.md §6.3).
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_config (
            node_id TEXT PRIMARY KEY,
            node_name TEXT NOT NULL,
            cluster_token TEXT NOT NULL,
            is_cluster_enabled INTEGER NOT NULL DEFAULT 0,
            region TEXT NOT NULL DEFAULT '',
            ca_cert_pem TEXT NOT NULL,
            ca_key_pem TEXT NOT NULL,
            node_cert_pem TEXT NOT NULL,
            node_key_pem TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_nodes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            node_token TEXT NOT NULL,
            region TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 0,
            health_status TEXT NOT NULL DEFAULT 'unknown',
            last_health_check TEXT,
            last_seen TEXT,
            latency_ms INTEGER,
            capacity_bytes INTEGER,
            used_bytes INTEGER,
            is_stale INTEGER NOT NULL DEFAULT 0,
            last_local_write_at TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS cluster_health_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id TEXT NOT NULL,
            status TEXT NOT NULL,
            latency_ms INTEGER,
            error_message TEXT,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_global_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_tenants (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            display_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            quota_bytes INTEGER,
            quota_objects INTEGER,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            tenant_id TEXT,
            roles_json TEXT NOT NULL DEFAULT '[]',
            policies_json TEXT NOT NULL DEFAULT '[]',
            auth_provider TEXT,
            auth_provider_subject TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_access_keys (
            access_key_id TEXT PRIMARY KEY,
            secret TEXT NOT NULL,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_bucket_permissions (
            id TEXT PRIMARY KEY,
            bucket TEXT NOT NULL,
            user_id TEXT,
            tenant_id TEXT,
            permission TEXT NOT NULL,
            grantor TEXT NOT NULL,
            granted_at TEXT NOT NULL,
            expires_at TEXT
        );

        CREATE TABLE IF NOT EXISTS cluster_idp_providers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            provider_type TEXT NOT NULL,
            tenant_id TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            config_json TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_group_mappings (
            id TEXT PRIMARY KEY,
            provider_id TEXT NOT NULL,
            external_group TEXT NOT NULL,
            role TEXT NOT NULL,
            tenant_id TEXT,
            auto_sync INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_deletion_log (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            deleted_by_node_id TEXT NOT NULL,
            deleted_at TEXT NOT NULL,
            UNIQUE(entity_type, entity_id)
        );

        CREATE TABLE IF NOT EXISTS cluster_sync_tenant (
            entity_id TEXT NOT NULL,
            destination_node_id TEXT NOT NULL,
            checksum TEXT NOT NULL,
            last_sync_at TEXT NOT NULL,
            PRIMARY KEY (entity_id, destination_node_id)
        );
        CREATE TABLE IF NOT EXISTS cluster_sync_user (
            entity_id TEXT NOT NULL,
            destination_node_id TEXT NOT NULL,
            checksum TEXT NOT NULL,
            last_sync_at TEXT NOT NULL,
            PRIMARY KEY (entity_id, destination_node_id)
        );
        CREATE TABLE IF NOT EXISTS cluster_sync_access_key (
            entity_id TEXT NOT NULL,
            destination_node_id TEXT NOT NULL,
            checksum TEXT NOT NULL,
            last_sync_at TEXT NOT NULL,
            PRIMARY KEY (entity_id, destination_node_id)
        );
        CREATE TABLE IF NOT EXISTS cluster_sync_bucket_permission (
            entity_id TEXT NOT NULL,
            destination_node_id TEXT NOT NULL,
            checksum TEXT NOT NULL,
            last_sync_at TEXT NOT NULL,
            PRIMARY KEY (entity_id, destination_node_id)
        );
        CREATE TABLE IF NOT EXISTS cluster_sync_idp_provider (
            entity_id TEXT NOT NULL,
            destination_node_id TEXT NOT NULL,
            checksum TEXT NOT NULL,
            last_sync_at TEXT NOT NULL,
            PRIMARY KEY (entity_id, destination_node_id)
        );
        CREATE TABLE IF NOT EXISTS cluster_sync_group_mapping (
            entity_id TEXT NOT NULL,
            destination_node_id TEXT NOT NULL,
            checksum TEXT NOT NULL,
            last_sync_at TEXT NOT NULL,
            PRIMARY KEY (entity_id, destination_node_id)
        );

        CREATE TABLE IF NOT EXISTS cluster_bucket_location_cache (
            bucket TEXT PRIMARY KEY,
            node_id TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Creates the data-plane's object-replication and migration tables. These
/// are out of scope functionally (spec.md §1) but share the same database
/// file, so the control plane still owns their `CREATE TABLE IF NOT EXISTS`
/// statements to keep one idempotent init path, as the teacher's
/// `InitSchema`/`InitReplicationSchema` split does.
pub async fn init_replication_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_replication_queue (
            id TEXT PRIMARY KEY,
            rule_id TEXT NOT NULL,
            tenant_id TEXT,
            source_bucket TEXT NOT NULL,
            object_key TEXT NOT NULL,
            dest_node_id TEXT NOT NULL,
            dest_bucket TEXT NOT NULL,
            operation TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 5,
            last_error TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS cluster_bucket_replication (
            id TEXT PRIMARY KEY,
            bucket TEXT NOT NULL,
            dest_node_id TEXT NOT NULL,
            dest_bucket TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_migrations (
            id TEXT PRIMARY KEY,
            bucket TEXT NOT NULL,
            source_node TEXT NOT NULL,
            target_node TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            objects_total INTEGER NOT NULL DEFAULT 0,
            objects_migrated INTEGER NOT NULL DEFAULT 0,
            bytes_total INTEGER NOT NULL DEFAULT 0,
            bytes_migrated INTEGER NOT NULL DEFAULT 0,
            verify_data INTEGER NOT NULL DEFAULT 1,
            delete_source INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
