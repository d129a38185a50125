// src/core/orchestrator.rs

//! The cluster orchestrator (C11): owns node identity, cluster membership,
//! TLS material, and the lifecycle of every background task (C4-C6, cert
//! renewal, deletion-log cleanup). Mirrors the teacher's top-level
//! `server::run` in shape — one struct that starts everything on a
//! `JoinSet` and tears it all down on a shared shutdown signal.

use crate::core::breaker::BreakerRegistry;
use crate::core::deletion_log;
use crate::core::errors::{ClusterError, ClusterResult};
use crate::core::health::HealthChecker;
use crate::core::model::{
    AccessKey, BucketPermission, ClusterConfig, GroupMapping, HealthStatus, IdpProvider, Node, Tenant, User,
};
use crate::core::reconcile::StaleReconciler;
use crate::core::store::Store;
use crate::core::sync::SyncManager;
use crate::core::tls::{ClusterCa, ClusterTls};
use crate::core::transport::{self, SharedTransport, SignedTransport};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{info, warn};
use uuid::Uuid;

/// Request/response DTOs for the join handshake. Shared between this module
/// (the client side, `JoinCluster`) and `server::internal_api` (the server
/// side handling `/validate-token` and `/register-node`).
#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateTokenRequest {
    pub cluster_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateTokenResponse {
    pub region: String,
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_id: Uuid,
    pub node_name: String,
    pub endpoint: String,
    pub region: String,
    pub node_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub node: Node,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<Node>,
}

/// Everything the running cluster needs shared across the axum handlers and
/// the background tasks: the store, the signed transport, TLS material, and
/// the breaker registry. Cheap to clone (every field is an `Arc` or a
/// `Clone`-able handle), matching the teacher's `ServerState` sharing
/// pattern.
#[derive(Clone)]
pub struct ClusterHandle {
    pub store: Store,
    pub transport: SharedTransport,
    pub tls: Option<Arc<ClusterTls>>,
    pub breakers: BreakerRegistry,
    pub local_node_id: Uuid,
}

pub struct ClusterOrchestrator {
    store: Store,
    handle: ClusterHandle,
    reconnect_rx: Option<mpsc::Receiver<()>>,
    reconnect_tx: mpsc::Sender<()>,
}

impl ClusterOrchestrator {
    /// Builds the orchestrator from whatever `cluster_config` row already
    /// exists (if any) — `None` means this node has never been initialized
    /// or joined.
    pub async fn load(store: Store) -> ClusterResult<Self> {
        let cfg = store.get_cluster_config().await?;
        let (reconnect_tx, reconnect_rx) = mpsc::channel(4);

        let (local_node_id, transport, tls) = match &cfg {
            Some(cfg) => {
                let ca = ClusterCa::from_existing(cfg.ca_cert_pem.clone(), cfg.ca_key_pem.clone())?;
                let node_key = crate::core::tls::CertifiedNodeKey {
                    cert_pem: cfg.node_cert_pem.clone(),
                    key_pem: cfg.node_key_pem.clone(),
                    not_after: ca.not_after,
                };
                let tls = Arc::new(ClusterTls::new(ca.cert_pem.clone(), node_key));
                let transport = Arc::new(SignedTransport::new(cfg.node_id, cluster_node_token(cfg), Some(&tls))?);
                (cfg.node_id, transport, Some(tls))
            }
            None => {
                let node_id = Uuid::new_v4();
                let transport = Arc::new(SignedTransport::new(node_id, String::new(), None)?);
                (node_id, transport, None)
            }
        };

        let handle = ClusterHandle {
            store: store.clone(),
            transport,
            tls,
            breakers: BreakerRegistry::default(),
            local_node_id,
        };

        Ok(Self {
            store,
            handle,
            reconnect_rx: Some(reconnect_rx),
            reconnect_tx,
        })
    }

    pub fn handle(&self) -> ClusterHandle {
        self.handle.clone()
    }

    /// `InitializeCluster(nodeName, region) -> clusterToken` (spec.md §4.11).
    /// Fails if a `cluster_config` row already exists.
    pub async fn initialize(&mut self, node_name: &str, endpoint: &str, region: &str) -> ClusterResult<String> {
        if self.store.get_cluster_config().await?.is_some() {
            return Err(ClusterError::AlreadyInitialized);
        }

        let node_id = Uuid::new_v4();
        let cluster_token = random_token();
        let ca = ClusterCa::generate(node_name)?;
        let node_key = ca.mint_node_cert(node_name)?;

        let cfg = ClusterConfig {
            node_id,
            node_name: node_name.to_string(),
            cluster_token: cluster_token.clone(),
            is_cluster_enabled: true,
            region: region.to_string(),
            ca_cert_pem: ca.cert_pem.clone(),
            ca_key_pem: ca.key_pem.clone(),
            node_cert_pem: node_key.cert_pem,
            node_key_pem: node_key.key_pem,
        };
        self.store.put_cluster_config(&cfg).await?;
        self.store
            .set_config_value("jwt_secret", &random_token())
            .await?;

        let self_node = Node {
            id: node_id,
            name: node_name.to_string(),
            endpoint: endpoint.to_string(),
            node_token: cluster_token.clone(),
            region: region.to_string(),
            priority: 0,
            health_status: HealthStatus::Healthy,
            last_health_check: None,
            last_seen: Some(chrono::Utc::now()),
            latency_ms: None,
            capacity_bytes: None,
            used_bytes: None,
            is_stale: false,
            last_local_write_at: None,
            metadata: Default::default(),
        };
        self.store.upsert_node(&self_node).await?;

        let tls = Arc::new(ClusterTls::new(
            ca.cert_pem.clone(),
            crate::core::tls::CertifiedNodeKey {
                cert_pem: cfg.node_cert_pem.clone(),
                key_pem: cfg.node_key_pem.clone(),
                not_after: ca.not_after,
            },
        ));
        self.handle.transport = Arc::new(SignedTransport::new(node_id, cluster_token.clone(), Some(&tls))?);
        self.handle.tls = Some(tls);
        self.handle.local_node_id = node_id;

        info!(node_id = %node_id, %node_name, "cluster initialized");
        Ok(cluster_token)
    }

    /// `JoinCluster(clusterToken, existingNodeURL)` (spec.md §4.11).
    /// Replaces any prior `cluster_config` row.
    pub async fn join(
        &mut self,
        cluster_token: &str,
        existing_node_url: &str,
        node_name: &str,
        endpoint: &str,
    ) -> ClusterResult<()> {
        let bootstrap = transport::build_insecure_bootstrap_client()?;

        let validate_resp: ValidateTokenResponse = bootstrap
            .post(format!(
                "{}/api/internal/cluster/validate-token",
                existing_node_url.trim_end_matches('/')
            ))
            .json(&ValidateTokenRequest {
                cluster_token: cluster_token.to_string(),
            })
            .send()
            .await?
            .json()
            .await?;

        let ca = ClusterCa::from_existing(validate_resp.ca_cert_pem.clone(), validate_resp.ca_key_pem.clone())?;
        let node_id = Uuid::new_v4();
        let node_token = random_token();
        let node_key = ca.mint_node_cert(node_name)?;

        let register_resp: RegisterNodeResponse = bootstrap
            .post(format!(
                "{}/api/internal/cluster/register-node",
                existing_node_url.trim_end_matches('/')
            ))
            .json(&RegisterNodeRequest {
                node_id,
                node_name: node_name.to_string(),
                endpoint: endpoint.to_string(),
                region: validate_resp.region.clone(),
                node_token: node_token.clone(),
            })
            .send()
            .await?
            .json()
            .await?;

        let cfg = ClusterConfig {
            node_id,
            node_name: node_name.to_string(),
            cluster_token: cluster_token.to_string(),
            is_cluster_enabled: true,
            region: validate_resp.region,
            ca_cert_pem: ca.cert_pem.clone(),
            ca_key_pem: ca.key_pem.clone(),
            node_cert_pem: node_key.cert_pem.clone(),
            node_key_pem: node_key.key_pem.clone(),
        };
        self.store.put_cluster_config(&cfg).await?;

        let mut self_node = register_resp.node;
        self_node.node_token = node_token.clone();
        self.store.upsert_node(&self_node).await?;

        let tls = Arc::new(ClusterTls::new(ca.cert_pem.clone(), node_key));
        let transport = Arc::new(SignedTransport::new(node_id, node_token, Some(&tls))?);

        let nodes: NodesResponse = transport
            .get_json(&format!(
                "{}/api/internal/cluster/nodes?cluster_token={}",
                existing_node_url.trim_end_matches('/'),
                cluster_token
            ))
            .await
            .unwrap_or(NodesResponse { nodes: Vec::new() });
        for node in nodes.nodes {
            if node.id != node_id {
                self.store.upsert_node(&node).await?;
            }
        }

        self.handle.transport = transport;
        self.handle.tls = Some(tls);
        self.handle.local_node_id = node_id;
        info!(node_id = %node_id, %existing_node_url, "joined cluster");
        Ok(())
    }

    /// `LeaveCluster` (spec.md §4.11): disables without erasing certs.
    pub async fn leave(&self) -> ClusterResult<()> {
        self.store.set_cluster_enabled(false).await?;
        info!("left cluster");
        Ok(())
    }

    /// Admin membership management beyond join/leave (SPEC_FULL.md §4
    /// implementation notes: `AddNode`/`RemoveNode`).
    pub async fn add_node(&self, node: &Node) -> ClusterResult<()> {
        self.store.upsert_node(node).await
    }

    pub async fn remove_node(&self, node_id: Uuid) -> ClusterResult<()> {
        self.store.remove_node(node_id).await
    }

    /// Tombstone cleanup age must be >= the staleness threshold, or a node
    /// offline longer than the TTL rejoins, misses tombstones that already
    /// expired, and resurrects deleted entities (spec.md §9 Open
    /// Questions). Checked once at boot.
    pub async fn validate_startup_invariants(&self) -> ClusterResult<()> {
        let staleness_secs: i64 = self
            .store
            .get_config_value("staleness_threshold_seconds")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(7 * 86_400);
        let tombstone_ttl_secs: i64 = self
            .store
            .get_config_value("tombstone_cleanup_age_seconds")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(7 * 86_400);

        if tombstone_ttl_secs < staleness_secs {
            return Err(ClusterError::InvalidInput(format!(
                "tombstone_cleanup_age_seconds ({tombstone_ttl_secs}) must be >= staleness_threshold_seconds ({staleness_secs})"
            )));
        }
        Ok(())
    }

    /// Starts every long-running background task and blocks until `stop`
    /// fires, following the teacher's `JoinSet`-of-tickers shape
    /// (`server::run`, `warden/worker.rs`).
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        if let Err(e) = self.validate_startup_invariants().await {
            warn!(error = %e, "startup invariant check failed, continuing with defaults");
        }

        if let Ok(Some(self_node)) = self.store.get_node(self.handle.local_node_id).await {
            if self_node.is_stale {
                let reconciler = StaleReconciler::new(self.store.clone(), self.handle.transport.clone(), self.handle.local_node_id);
                if let Err(e) = reconciler.run().await {
                    warn!(error = %e, "startup reconcile failed");
                }
            }
        }

        let mut tasks = JoinSet::new();

        let health = HealthChecker::new(
            self.store.clone(),
            self.handle.transport.clone(),
            self.handle.local_node_id,
            self.reconnect_tx.clone(),
        );
        tasks.spawn(health.run(stop.clone()));

        macro_rules! spawn_sync_manager {
            ($entity:ty) => {
                let manager = SyncManager::<$entity>::new(
                    self.store.clone(),
                    self.handle.transport.clone(),
                    self.handle.local_node_id,
                );
                tasks.spawn(manager.run(stop.clone()));
            };
        }
        spawn_sync_manager!(Tenant);
        spawn_sync_manager!(User);
        spawn_sync_manager!(AccessKey);
        spawn_sync_manager!(BucketPermission);
        spawn_sync_manager!(IdpProvider);
        spawn_sync_manager!(GroupMapping);

        if let Some(reconnect_rx) = self.reconnect_rx.take() {
            tasks.spawn(run_reconcile_on_reconnect(
                self.store.clone(),
                self.handle.transport.clone(),
                self.handle.local_node_id,
                reconnect_rx,
                stop.clone(),
            ));
        }

        tasks.spawn(run_deletion_cleanup_loop(self.store.clone(), stop.clone()));

        if let Some(tls) = self.handle.tls.clone() {
            tasks.spawn(run_cert_renewal_loop(self.store.clone(), tls, stop.clone()));
        }

        loop {
            tokio::select! {
                res = tasks.join_next() => {
                    match res {
                        Some(Ok(())) => {}
                        Some(Err(e)) => warn!(error = %e, "background task panicked"),
                        None => break,
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("orchestrator shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn run_reconcile_on_reconnect(
    store: Store,
    transport: SharedTransport,
    local_node_id: Uuid,
    mut reconnect_rx: mpsc::Receiver<()>,
    mut stop: watch::Receiver<bool>,
) {
    let reconciler = StaleReconciler::new(store, transport, local_node_id);
    loop {
        tokio::select! {
            signal = reconnect_rx.recv() => {
                match signal {
                    Some(()) => {
                        if let Err(e) = reconciler.run().await {
                            warn!(error = %e, "reconnect-triggered reconcile failed");
                        }
                    }
                    None => return,
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_deletion_cleanup_loop(store: Store, mut stop: watch::Receiver<bool>) {
    let mut ticker = time::interval(std::time::Duration::from_secs(3600));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let max_age_secs: i64 = store
                    .get_config_value("tombstone_cleanup_age_seconds")
                    .await
                    .ok()
                    .flatten()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(7 * 86_400);
                if let Err(e) = deletion_log::cleanup_old_deletions(&store, chrono::Duration::seconds(max_age_secs)).await {
                    warn!(error = %e, "tombstone cleanup failed");
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }
    }
}

/// Monthly certificate renewal ticker (spec.md §4.11): regenerates the node
/// cert when it's within 30 days of expiry, hot-swaps it via `ClusterTls`,
/// and warns if the CA itself is within a year of expiry.
async fn run_cert_renewal_loop(store: Store, tls: Arc<ClusterTls>, mut stop: watch::Receiver<bool>) {
    let mut ticker = time::interval(std::time::Duration::from_secs(30 * 24 * 3600));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_and_renew(&store, &tls).await;
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }
    }
}

async fn check_and_renew(store: &Store, tls: &ClusterTls) {
    let Ok(Some(cfg)) = store.get_cluster_config().await else {
        return;
    };

    let Ok(ca) = ClusterCa::from_existing(cfg.ca_cert_pem.clone(), cfg.ca_key_pem.clone()) else {
        return;
    };
    if ca.expires_within(chrono::Duration::days(365)) {
        warn!("cluster CA expires within one year, plan a cluster-wide CA rotation");
    }

    if !tls.needs_renewal(chrono::Duration::days(30)) {
        return;
    }

    match ca.mint_node_cert(&cfg.node_name) {
        Ok(new_key) => {
            let mut updated_cfg = cfg;
            updated_cfg.node_cert_pem = new_key.cert_pem.clone();
            updated_cfg.node_key_pem = new_key.key_pem.clone();
            if let Err(e) = store.put_cluster_config(&updated_cfg).await {
                warn!(error = %e, "failed to persist renewed node certificate");
                return;
            }
            tls.rotate(new_key);
            info!("node certificate renewed");
        }
        Err(e) => warn!(error = %e, "certificate renewal failed"),
    }
}

fn cluster_node_token(cfg: &ClusterConfig) -> String {
    cfg.cluster_token.clone()
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_seeds_config_and_self_node() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut orchestrator = ClusterOrchestrator::load(store.clone()).await.unwrap();
        let token = orchestrator.initialize("node-a", "https://node-a:9000", "us-east").await.unwrap();
        assert!(!token.is_empty());

        let cfg = store.get_cluster_config().await.unwrap().unwrap();
        assert_eq!(cfg.node_name, "node-a");
        assert!(cfg.is_cluster_enabled);

        let self_node = store.get_node(cfg.node_id).await.unwrap().unwrap();
        assert_eq!(self_node.name, "node-a");
    }

    #[tokio::test]
    async fn initialize_twice_fails() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut orchestrator = ClusterOrchestrator::load(store.clone()).await.unwrap();
        orchestrator.initialize("node-a", "https://node-a:9000", "us-east").await.unwrap();

        let mut second = ClusterOrchestrator::load(store).await.unwrap();
        let err = second.initialize("node-a", "https://node-a:9000", "us-east").await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn leave_disables_without_erasing_certs() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut orchestrator = ClusterOrchestrator::load(store.clone()).await.unwrap();
        orchestrator.initialize("node-a", "https://node-a:9000", "us-east").await.unwrap();

        orchestrator.leave().await.unwrap();
        let cfg = store.get_cluster_config().await.unwrap().unwrap();
        assert!(!cfg.is_cluster_enabled);
        assert!(!cfg.ca_cert_pem.is_empty());
    }

    #[tokio::test]
    async fn startup_invariant_rejects_ttl_below_staleness_threshold() {
        let store = Store::connect_in_memory().await.unwrap();
        store.set_config_value("staleness_threshold_seconds", "1000000").await.unwrap();
        store.set_config_value("tombstone_cleanup_age_seconds", "10").await.unwrap();
        let orchestrator = ClusterOrchestrator::load(store).await.unwrap();
        let err = orchestrator.validate_startup_invariants().await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidInput(_)));
    }
}
