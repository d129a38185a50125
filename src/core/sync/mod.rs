// src/core/sync/mod.rs

//! The per-entity sync engine (C4): one generic pusher parameterized by
//! `SyncableEntity`, instantiated six times (see `entities.rs`). Mirrors the
//! teacher's `MasterMonitor` shape (a cloneable struct wrapping an
//! independent periodic loop, `warden/worker.rs`) rather than six
//! hand-duplicated managers, per the design notes in spec.md §9.

mod entities;

pub use entities::*;

use crate::core::deletion_log;
use crate::core::errors::ClusterResult;
use crate::core::metrics;
use crate::core::model::{DeletionEntry, EntityType, Node};
use crate::core::store::Store;
use crate::core::transport::SharedTransport;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Joins canonical fields with `|` and takes the SHA-256 hex digest,
/// per spec.md §4.4 `syncOne`: "a canonical field order documented per
/// entity (stable across runs)".
pub fn canonical_checksum(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fields.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

/// The protocol every replicated entity type implements: list/get/upsert
/// against the store, a stable checksum, and the LWW timestamp compared on
/// receive (spec.md §9 "Polymorphism across the six entity types").
#[async_trait]
pub trait SyncableEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const ENTITY_TYPE: EntityType;

    fn id_string(&self) -> String;
    fn checksum(&self) -> String;
    fn lww_timestamp(&self) -> chrono::DateTime<chrono::Utc>;

    async fn list_local(store: &Store) -> ClusterResult<Vec<Self>>;
    async fn get_local(store: &Store, id: &str) -> ClusterResult<Option<Self>>;
    async fn upsert(store: &Store, entity: &Self) -> ClusterResult<()>;
}

/// Applies an incoming pushed record under LWW (spec.md §4.4 "Receive
/// side"): drop silently if the local record is strictly newer, else
/// upsert. Returns whether the write was applied.
pub async fn receive_push<E: SyncableEntity>(store: &Store, incoming: E) -> ClusterResult<bool> {
    if let Some(local) = E::get_local(store, &incoming.id_string()).await? {
        if local.lww_timestamp() > incoming.lww_timestamp() {
            debug!(
                entity_type = %E::ENTITY_TYPE,
                id = %incoming.id_string(),
                "dropping stale push: local record is newer"
            );
            return Ok(false);
        }
    }
    E::upsert(store, &incoming).await?;
    Ok(true)
}

/// The generic periodic pusher for one entity type (C4). Runs one tick per
/// `{entity}_sync_interval_seconds`, reading its enable flag and interval
/// from the persistent `cluster_global_config` table at start-up the way
/// the teacher's `MasterMonitor::run` reads `down_after` once before
/// entering its loop.
pub struct SyncManager<E: SyncableEntity> {
    store: Store,
    transport: SharedTransport,
    local_node_id: Uuid,
    _entity: PhantomData<E>,
}

impl<E: SyncableEntity> SyncManager<E> {
    pub fn new(store: Store, transport: SharedTransport, local_node_id: Uuid) -> Self {
        Self {
            store,
            transport,
            local_node_id,
            _entity: PhantomData,
        }
    }

    async fn read_interval(&self) -> Duration {
        let key = format!("{}_sync_interval_seconds", E::ENTITY_TYPE.config_key_segment());
        match self.store.get_config_value(&key).await {
            Ok(Some(v)) => v.parse().map(Duration::from_secs).unwrap_or(Duration::from_secs(30)),
            _ => Duration::from_secs(30),
        }
    }

    async fn sync_enabled(&self) -> bool {
        let key = format!("auto_{}_sync_enabled", E::ENTITY_TYPE.config_key_segment());
        match self.store.get_config_value(&key).await {
            Ok(Some(v)) => v != "false",
            _ => true,
        }
    }

    /// Runs the ticker until `stop` observes `true`, exactly the
    /// "drain on ctx.Done or stopChan" shutdown shape from spec.md §9.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let interval = self.read_interval().await;
        let mut ticker = time::interval(interval);
        info!(entity_type = %E::ENTITY_TYPE, ?interval, "sync manager started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!(entity_type = %E::ENTITY_TYPE, "sync manager stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One background-task tick (spec.md §4.4 steps 1-6).
    pub async fn tick(&self) {
        let cfg = match self.store.get_cluster_config().await {
            Ok(Some(cfg)) => cfg,
            _ => return,
        };
        if !cfg.is_cluster_enabled {
            return;
        }
        if !self.sync_enabled().await {
            return;
        }

        let peers = match self.store.list_healthy_peers(self.local_node_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(entity_type = %E::ENTITY_TYPE, error = %e, "failed to list healthy peers");
                return;
            }
        };
        if peers.is_empty() {
            return;
        }

        let records = match E::list_local(&self.store).await {
            Ok(r) => r,
            Err(e) => {
                warn!(entity_type = %E::ENTITY_TYPE, error = %e, "failed to list local records");
                return;
            }
        };

        for record in &records {
            for peer in &peers {
                self.sync_one(record, peer).await;
            }
        }

        self.sync_deletions(&peers).await;
    }

    /// `syncOne` (spec.md §4.4): checksum-gated push of a single record to
    /// a single peer. Failures are logged and swallowed — the next tick
    /// retries (spec.md §7 propagation policy).
    async fn sync_one(&self, record: &E, peer: &Node) {
        let checksum = record.checksum();
        let id = record.id_string();

        let stored = self
            .store
            .get_sync_checksum(E::ENTITY_TYPE, &id, peer.id)
            .await
            .unwrap_or(None);
        if stored.as_deref() == Some(checksum.as_str()) {
            return;
        }

        let url = format!(
            "{}/api/internal/cluster/{}-sync",
            peer.endpoint.trim_end_matches('/'),
            E::ENTITY_TYPE.path_segment()
        );
        match self.transport.post_json::<E, serde_json::Value>(&url, record).await {
            Ok(_) => {
                if let Err(e) = self
                    .store
                    .update_sync_status(E::ENTITY_TYPE, &id, peer.id, &checksum)
                    .await
                {
                    warn!(entity_type = %E::ENTITY_TYPE, error = %e, "failed to persist sync status");
                }
                metrics::SYNC_PUSHES_TOTAL
                    .with_label_values(&[E::ENTITY_TYPE.path_segment(), "success"])
                    .inc();
            }
            Err(e) => {
                debug!(entity_type = %E::ENTITY_TYPE, peer = %peer.id, error = %e, "push failed, will retry next tick");
                metrics::SYNC_PUSHES_TOTAL
                    .with_label_values(&[E::ENTITY_TYPE.path_segment(), "failure"])
                    .inc();
            }
        }
    }

    /// `syncDeletions` (spec.md §4.4): fan out this entity type's
    /// tombstones to every peer. Per-peer errors are non-fatal.
    async fn sync_deletions(&self, peers: &[Node]) {
        let tombstones = match deletion_log::list_deletions(&self.store, E::ENTITY_TYPE).await {
            Ok(t) => t,
            Err(e) => {
                warn!(entity_type = %E::ENTITY_TYPE, error = %e, "failed to list tombstones");
                return;
            }
        };
        if tombstones.is_empty() {
            return;
        }

        for peer in peers {
            for tombstone in &tombstones {
                self.push_tombstone(peer, tombstone).await;
            }
        }
    }

    async fn push_tombstone(&self, peer: &Node, tombstone: &DeletionEntry) {
        let url = format!(
            "{}/api/internal/cluster/{}-delete-sync",
            peer.endpoint.trim_end_matches('/'),
            E::ENTITY_TYPE.path_segment()
        );
        match self
            .transport
            .post_json::<DeletionEntry, serde_json::Value>(&url, tombstone)
            .await
        {
            Ok(_) => {
                metrics::TOMBSTONE_PUSHES_TOTAL
                    .with_label_values(&[E::ENTITY_TYPE.path_segment()])
                    .inc();
            }
            Err(e) => {
                debug!(entity_type = %E::ENTITY_TYPE, peer = %peer.id, error = %e, "tombstone push failed, will retry next tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_checksum_equal_and_any_field_change_differs() {
        let a = canonical_checksum(&["acme", "Acme Inc", "active", "2024-01-01T00:00:00Z"]);
        let b = canonical_checksum(&["acme", "Acme Inc", "active", "2024-01-01T00:00:00Z"]);
        assert_eq!(a, b);

        let c = canonical_checksum(&["acme", "Acme Inc", "suspended", "2024-01-01T00:00:00Z"]);
        assert_ne!(a, c);
    }
}
