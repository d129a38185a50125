// tests/integration/helpers.rs

//! Shared test harness: spins up a real node (in-memory store + the actual
//! `internal_api` router bound to an ephemeral port) so scenario tests can
//! drive real cluster traffic over HTTP instead of calling handlers
//! directly, mirroring the teacher's `TestContext` helper.

use chrono::Utc;
use maxiofs_cluster::core::breaker::BreakerRegistry;
use maxiofs_cluster::core::model::{ClusterConfig, HealthStatus, Node};
use maxiofs_cluster::core::orchestrator::ClusterHandle;
use maxiofs_cluster::core::store::Store;
use maxiofs_cluster::core::transport::SignedTransport;
use maxiofs_cluster::server;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A running node under test: a real `Store`, a real `ClusterHandle`, and a
/// real `internal_api` server listening on loopback.
pub struct TestNode {
    pub id: Uuid,
    pub token: String,
    pub store: Store,
    pub handle: ClusterHandle,
    pub endpoint: String,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
}

impl TestNode {
    /// Starts a node with cluster membership already enabled (as if
    /// `InitializeCluster` had already run), with no peers registered yet.
    pub async fn spawn(name: &str) -> Self {
        let store = Store::connect_in_memory().await.expect("in-memory store");
        let id = Uuid::new_v4();
        let token = format!("test-token-{}", Uuid::new_v4());

        store
            .put_cluster_config(&ClusterConfig {
                node_id: id,
                node_name: name.to_string(),
                cluster_token: "shared-cluster-token".to_string(),
                is_cluster_enabled: true,
                region: "test-region".to_string(),
                ca_cert_pem: String::new(),
                ca_key_pem: String::new(),
                node_cert_pem: String::new(),
                node_key_pem: String::new(),
            })
            .await
            .expect("seed cluster_config");

        let transport = Arc::new(SignedTransport::new(id, token.clone(), None).expect("build transport"));
        let handle = ClusterHandle {
            store: store.clone(),
            transport,
            tls: None,
            breakers: BreakerRegistry::default(),
            local_node_id: id,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let endpoint = format!("http://{addr}");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let app = server::build_router(server::internal_api::ApiState {
            handle: handle.clone(),
            lister: None,
        });
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
                .expect("test server failed");
        });

        Self {
            id,
            token,
            store,
            handle,
            endpoint,
            shutdown: shutdown_tx,
            server,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.server.await;
    }

    /// Registers `self` as a healthy peer of `other`, in `other`'s store
    /// only — call twice (swapping arguments) for a bidirectional link.
    pub async fn register_as_peer_of(&self, other: &TestNode) {
        other
            .store
            .upsert_node(&Node {
                id: self.id,
                name: format!("node-{}", self.id),
                endpoint: self.endpoint.clone(),
                node_token: self.token.clone(),
                region: "test-region".to_string(),
                priority: 0,
                health_status: HealthStatus::Healthy,
                last_health_check: Some(Utc::now()),
                last_seen: Some(Utc::now()),
                latency_ms: Some(5),
                capacity_bytes: None,
                used_bytes: None,
                is_stale: false,
                last_local_write_at: None,
                metadata: Default::default(),
            })
            .await
            .expect("register peer");
    }
}

/// Links two nodes as mutual healthy peers, the state `JoinCluster` would
/// leave both sides in after a successful handshake.
pub async fn link(a: &TestNode, b: &TestNode) {
    a.register_as_peer_of(b).await;
    b.register_as_peer_of(a).await;
}

pub fn new_tenant(name: &str) -> maxiofs_cluster::core::model::Tenant {
    let now = Utc::now();
    maxiofs_cluster::core::model::Tenant {
        id: Uuid::new_v4(),
        name: name.to_string(),
        display_name: name.to_string(),
        status: "active".to_string(),
        quota_bytes: None,
        quota_objects: None,
        metadata_json: "{}".to_string(),
        created_at: now,
        updated_at: now,
    }
}
