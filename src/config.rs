// src/config.rs

//! Static runtime configuration for the cluster control plane
//! (SPEC_FULL.md §2.3): the TOML file an operator hands to `maxiofs-clusterd`
//! at boot. Cluster-wide, runtime-tunable knobs (sync intervals, staleness
//! threshold, tombstone cleanup age) live instead in the persistent
//! `cluster_global_config` table (`Store::get_config_value`) so they can be
//! retuned without a restart.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level config file shape, loaded with the `config` crate
/// (`config::File`) the way the rest of the ambient stack is documented in
/// SPEC_FULL.md §2.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRuntimeConfig {
    /// Address the internal cluster API (and `/health`, `/metrics`) binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// This node's externally reachable endpoint, advertised to peers on
    /// `InitializeCluster`/`JoinCluster` (spec.md §4.11).
    pub public_endpoint: String,

    /// Path to the per-node SQLite catalog database (spec.md §6.3). Passed
    /// straight to `sqlx::SqlitePool` as `sqlite://{path}`.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub node_name: Option<String>,

    #[serde(default)]
    pub region: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub defaults: DefaultIntervals,
}

/// Whether inbound connections require a client certificate signed by the
/// cluster's internal CA (spec.md §6.2). Disabled until a node has joined
/// or initialized a cluster — `ClusterOrchestrator::load` decides that from
/// the persisted `cluster_config` row, not from this file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// If true, refuse to start serving the internal API until cluster TLS
    /// material is loaded. Operators running a single, never-clustered
    /// node can leave this false to serve plaintext.
    #[serde(default)]
    pub require_mtls: bool,
}

/// Startup defaults for knobs that are otherwise stored persistently
/// (spec.md §6.4) — used only to seed `cluster_global_config` the first
/// time a row is missing, never read again after that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultIntervals {
    #[serde(default = "default_sync_interval_secs")]
    pub entity_sync_interval_seconds: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_seconds: i64,
    #[serde(default = "default_tombstone_cleanup_age_secs")]
    pub tombstone_cleanup_age_seconds: i64,
    #[serde(default = "default_health_history_retention_days")]
    pub health_history_retention_days: i64,
    #[serde(default = "default_bucket_cache_ttl_secs")]
    pub bucket_location_cache_ttl_seconds: u64,
}

impl Default for DefaultIntervals {
    fn default() -> Self {
        Self {
            entity_sync_interval_seconds: default_sync_interval_secs(),
            health_check_interval_seconds: default_health_check_interval_secs(),
            staleness_threshold_seconds: default_staleness_threshold_secs(),
            tombstone_cleanup_age_seconds: default_tombstone_cleanup_age_secs(),
            health_history_retention_days: default_health_history_retention_days(),
            bucket_location_cache_ttl_seconds: default_bucket_cache_ttl_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:9100".to_string()
}
fn default_database_path() -> PathBuf {
    PathBuf::from("maxiofs-cluster.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_sync_interval_secs() -> u64 {
    30
}
fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_staleness_threshold_secs() -> i64 {
    7 * 86_400
}
fn default_tombstone_cleanup_age_secs() -> i64 {
    7 * 86_400
}
fn default_health_history_retention_days() -> i64 {
    30
}
fn default_bucket_cache_ttl_secs() -> u64 {
    5 * 60
}

impl ClusterRuntimeConfig {
    /// Loads and validates the TOML config at `path` using the `config`
    /// crate, mirroring the teacher's `Config::from_file` validate-on-load
    /// shape (`config.rs`) even though the teacher itself reaches for raw
    /// `toml::from_str` — the `config` crate is already part of the
    /// dependency stack and gives layered env-var overrides for free.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MAXIOFS_CLUSTER").separator("__"))
            .build()
            .with_context(|| format!("failed to load config from '{path}'"))?;

        let cfg: ClusterRuntimeConfig = raw
            .try_deserialize()
            .with_context(|| format!("failed to parse config from '{path}'"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Logical consistency checks beyond what serde defaults cover.
    /// Per spec.md §9 Open Questions, the tombstone TTL must be at least
    /// the staleness threshold or a node offline longer than the TTL
    /// rejoins having missed tombstones that already expired.
    fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(anyhow!("listen_addr cannot be empty"));
        }
        if self.public_endpoint.trim().is_empty() {
            return Err(anyhow!("public_endpoint cannot be empty"));
        }
        if self.defaults.tombstone_cleanup_age_seconds < self.defaults.staleness_threshold_seconds {
            return Err(anyhow!(
                "tombstone_cleanup_age_seconds ({}) must be >= staleness_threshold_seconds ({})",
                self.defaults.tombstone_cleanup_age_seconds,
                self.defaults.staleness_threshold_seconds
            ));
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.database_path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_tombstone_ttl_below_staleness_threshold() {
        let cfg = ClusterRuntimeConfig {
            listen_addr: default_listen_addr(),
            public_endpoint: "https://node-a.example.com:9100".into(),
            database_path: default_database_path(),
            node_name: None,
            region: String::new(),
            log_level: default_log_level(),
            tls: TlsConfig::default(),
            defaults: DefaultIntervals {
                staleness_threshold_seconds: 1_000_000,
                tombstone_cleanup_age_seconds: 10,
                ..Default::default()
            },
        };
        assert!(cfg.validate().is_err());
    }
}
