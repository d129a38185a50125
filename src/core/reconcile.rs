// src/core/reconcile.rs

//! The stale reconciler (C6): runs once per reconnect to bring a node that
//! was isolated (offline or partitioned) back in sync with the rest of the
//! cluster, per spec.md §4.6.

use crate::core::deletion_log;
use crate::core::errors::ClusterResult;
use crate::core::metrics;
use crate::core::model::{
    AccessKey, BucketPermission, DeletionEntry, EntityStamp, EntityType, GroupMapping, IdpProvider,
    Node, ReconcileMode, StateSnapshot, Tenant, User,
};
use crate::core::snapshot::build_snapshot;
use crate::core::store::Store;
use crate::core::sync::SyncableEntity;
use crate::core::transport::SharedTransport;
use chrono::Utc;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

pub struct StaleReconciler {
    store: Store,
    transport: SharedTransport,
    local_node_id: Uuid,
}

impl StaleReconciler {
    pub fn new(store: Store, transport: SharedTransport, local_node_id: Uuid) -> Self {
        Self {
            store,
            transport,
            local_node_id,
        }
    }

    /// Runs one reconcile pass. A no-op if the local node isn't currently
    /// flagged stale (spec.md §4.6 step 1).
    pub async fn run(&self) -> ClusterResult<()> {
        let Some(self_node) = self.store.get_node(self.local_node_id).await? else {
            return Ok(());
        };
        if !self_node.is_stale {
            return Ok(());
        }

        let mode = self_node.reconcile_mode();
        info!(?mode, "stale reconciler starting");

        let peers = self.store.list_healthy_peers(self.local_node_id).await?;
        if peers.is_empty() {
            warn!("no healthy peers available, leaving node flagged stale for retry");
            return Ok(());
        }

        let local_snapshot = build_snapshot(&self.store, self.local_node_id).await?;

        for peer in &peers {
            if let Err(e) = self.reconcile_with_peer(mode, &local_snapshot, peer).await {
                warn!(peer = %peer.id, error = %e, "reconcile with peer failed, continuing with remaining peers");
            }
        }

        metrics::RECONCILE_RUNS_TOTAL
            .with_label_values(&[reconcile_mode_label(mode)])
            .inc();

        let mut cleared = self_node;
        cleared.is_stale = false;
        cleared.last_local_write_at = None;
        self.store.upsert_node(&cleared).await?;
        info!("stale reconciler finished, flag cleared");

        Ok(())
    }

    async fn reconcile_with_peer(
        &self,
        mode: ReconcileMode,
        local: &StateSnapshot,
        peer: &Node,
    ) -> ClusterResult<()> {
        let url = format!(
            "{}/api/internal/cluster/state-snapshot",
            peer.endpoint.trim_end_matches('/')
        );
        let remote: StateSnapshot = self.transport.get_json(&url).await?;

        if mode == ReconcileMode::Partition {
            self.push_newer::<Tenant>(peer, &local.tenants, &remote.tenants).await;
            self.push_newer::<User>(peer, &local.users, &remote.users).await;
            self.push_newer::<AccessKey>(peer, &local.access_keys, &remote.access_keys).await;
            self.push_newer::<BucketPermission>(peer, &local.bucket_permissions, &remote.bucket_permissions)
                .await;
            self.push_newer::<IdpProvider>(peer, &local.idp_providers, &remote.idp_providers).await;
            self.push_newer::<GroupMapping>(peer, &local.group_mappings, &remote.group_mappings).await;
        }

        self.push_missing_tombstones(peer, &local.tombstones, &remote.tombstones).await;
        self.apply_remote_tombstones(&remote.tombstones).await;

        Ok(())
    }

    /// Pushes every local record whose stamp is absent from, or strictly
    /// newer than, the peer's corresponding stamp (spec.md §4.6 step 5b).
    /// One explicit call per entity type, matching the non-generic style
    /// already used for the six `SyncableEntity` impls.
    async fn push_newer<E: SyncableEntity>(&self, peer: &Node, local_stamps: &[EntityStamp], remote_stamps: &[EntityStamp]) {
        let remote_by_id: HashMap<&str, chrono::DateTime<Utc>> =
            remote_stamps.iter().map(|s| (s.id.as_str(), s.updated_at)).collect();

        for stamp in local_stamps {
            let needs_push = match remote_by_id.get(stamp.id.as_str()) {
                None => true,
                Some(remote_ts) => stamp.updated_at > *remote_ts,
            };
            if !needs_push {
                continue;
            }

            let Ok(Some(record)) = E::get_local(&self.store, &stamp.id).await else {
                continue;
            };
            let url = format!(
                "{}/api/internal/cluster/{}-sync",
                peer.endpoint.trim_end_matches('/'),
                E::ENTITY_TYPE.path_segment()
            );
            if let Err(e) = self.transport.post_json::<E, serde_json::Value>(&url, &record).await {
                warn!(entity_type = %E::ENTITY_TYPE, peer = %peer.id, error = %e, "reconcile push failed");
            }
        }
    }

    async fn push_missing_tombstones(&self, peer: &Node, local: &[DeletionEntry], remote: &[DeletionEntry]) {
        let remote_by_key: HashMap<(&str, &str), chrono::DateTime<Utc>> = remote
            .iter()
            .map(|t| ((t.entity_type.as_str(), t.entity_id.as_str()), t.deleted_at))
            .collect();

        let missing: Vec<&DeletionEntry> = local
            .iter()
            .filter(|t| {
                match remote_by_key.get(&(t.entity_type.as_str(), t.entity_id.as_str())) {
                    None => true,
                    Some(remote_ts) => t.deleted_at > *remote_ts,
                }
            })
            .collect();
        if missing.is_empty() {
            return;
        }

        let url = format!(
            "{}/api/internal/cluster/deletion-log-sync",
            peer.endpoint.trim_end_matches('/')
        );
        if let Err(e) = self.transport.post_json::<Vec<&DeletionEntry>, serde_json::Value>(&url, &missing).await {
            warn!(peer = %peer.id, error = %e, "bulk tombstone push failed");
        }
    }

    async fn apply_remote_tombstones(&self, remote: &[DeletionEntry]) {
        for tombstone in remote {
            let Ok(entity_type) = tombstone.entity_type.parse::<EntityType>() else {
                continue;
            };
            if let Err(e) = deletion_log::apply_incoming_tombstone(
                &self.store,
                entity_type,
                &tombstone.entity_id,
                tombstone.deleted_by_node_id,
                tombstone.deleted_at,
            )
            .await
            {
                warn!(entity_id = %tombstone.entity_id, error = %e, "failed to apply remote tombstone");
            }
        }
    }
}

fn reconcile_mode_label(mode: ReconcileMode) -> &'static str {
    match mode {
        ReconcileMode::Offline => "offline",
        ReconcileMode::Partition => "partition",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::HealthStatus;

    fn stale_node(id: Uuid, last_local_write_at: Option<chrono::DateTime<Utc>>) -> Node {
        Node {
            id,
            name: "self".into(),
            endpoint: "https://self".into(),
            node_token: "tok".into(),
            region: "".into(),
            priority: 0,
            health_status: HealthStatus::Healthy,
            last_health_check: None,
            last_seen: None,
            latency_ms: None,
            capacity_bytes: None,
            used_bytes: None,
            is_stale: true,
            last_local_write_at,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn non_stale_node_is_a_no_op() {
        let store = Store::connect_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        let mut node = stale_node(id, None);
        node.is_stale = false;
        store.upsert_node(&node).await.unwrap();

        let transport = std::sync::Arc::new(
            crate::core::transport::SignedTransport::new(id, "tok".into(), None).unwrap(),
        );
        let reconciler = StaleReconciler::new(store.clone(), transport, id);
        reconciler.run().await.unwrap();

        let reloaded = store.get_node(id).await.unwrap().unwrap();
        assert!(!reloaded.is_stale);
    }

    #[tokio::test]
    async fn stale_node_with_no_peers_stays_flagged() {
        let store = Store::connect_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        store.upsert_node(&stale_node(id, None)).await.unwrap();

        let transport = std::sync::Arc::new(
            crate::core::transport::SignedTransport::new(id, "tok".into(), None).unwrap(),
        );
        let reconciler = StaleReconciler::new(store.clone(), transport, id);
        reconciler.run().await.unwrap();

        let reloaded = store.get_node(id).await.unwrap().unwrap();
        assert!(reloaded.is_stale, "flag must remain set when no peers are reachable");
    }

    #[test]
    fn entity_type_parse_round_trips_through_display() {
        for et in [
            EntityType::Tenant,
            EntityType::User,
            EntityType::AccessKey,
            EntityType::BucketPermission,
            EntityType::IdpProvider,
            EntityType::GroupMapping,
        ] {
            let rendered = et.to_string();
            let parsed: EntityType = rendered.parse().unwrap();
            assert_eq!(parsed, et);
        }
    }
}
