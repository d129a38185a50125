// src/core/health/mod.rs

//! The health checker and staleness detector (C5). Structured after the
//! teacher's `MasterMonitor` (`core/warden/worker.rs`): a cloneable struct
//! that spawns its sub-loops on a `JoinSet` and runs them until told to
//! stop.

use crate::core::errors::ClusterResult;
use crate::core::metrics;
use crate::core::model::{HealthHistoryEntry, HealthStatus, Node};
use crate::core::store::Store;
use crate::core::transport::SharedTransport;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEGRADED_LATENCY_THRESHOLD_MS: i64 = 1000;
const LAST_PEER_CONTACT_KEY: &str = "health.last_peer_contact_at";

#[derive(Clone)]
pub struct HealthChecker {
    store: Store,
    transport: SharedTransport,
    local_node_id: Uuid,
    /// Signals the orchestrator that at least one peer became reachable
    /// again while this node's own row was marked stale — the "reconnect"
    /// event spec.md §4.6 says triggers the stale reconciler.
    reconnect_tx: mpsc::Sender<()>,
}

impl HealthChecker {
    pub fn new(store: Store, transport: SharedTransport, local_node_id: Uuid, reconnect_tx: mpsc::Sender<()>) -> Self {
        Self {
            store,
            transport,
            local_node_id,
            reconnect_tx,
        }
    }

    async fn health_check_interval(&self) -> std::time::Duration {
        read_duration_secs(&self.store, "health_check_interval_seconds", 30).await
    }

    async fn history_cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(3600)
    }

    async fn history_retention_days(&self) -> i64 {
        match self.store.get_config_value("health_history_retention_days").await {
            Ok(Some(v)) => v.parse().unwrap_or(30),
            _ => 30,
        }
    }

    /// Staleness threshold, default 7 days (spec.md §4.5), shared with the
    /// tombstone-cleanup-age startup invariant check.
    pub async fn staleness_threshold(&self) -> chrono::Duration {
        let secs = match self.store.get_config_value("staleness_threshold_seconds").await {
            Ok(Some(v)) => v.parse().unwrap_or(7 * 86_400),
            _ => 7 * 86_400,
        };
        chrono::Duration::seconds(secs)
    }

    pub async fn run(self, stop: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().run_probe_loop(stop.clone()));
        tasks.spawn(self.clone().run_cleanup_loop(stop));

        if let Some(res) = tasks.join_next().await {
            warn!("health checker sub-task exited unexpectedly: {:?}", res);
        }
    }

    async fn run_probe_loop(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.health_check_interval().await);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_cleanup_loop(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.history_cleanup_interval().await);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let retention = self.history_retention_days().await;
                    match self.store.cleanup_health_history(retention).await {
                        Ok(n) if n > 0 => debug!(removed = n, "cleaned up health history"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "health history cleanup failed"),
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

    /// One probe pass over every peer (spec.md §4.5).
    async fn tick(&self) {
        let nodes = match self.store.list_nodes().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to list nodes for health check");
                return;
            }
        };

        let mut any_peer_healthy = false;
        for node in nodes.iter().filter(|n| n.id != self.local_node_id) {
            if self.probe_one(node).await {
                any_peer_healthy = true;
            }
        }

        self.update_self_staleness(any_peer_healthy).await;
    }

    async fn probe_one(&self, node: &Node) -> bool {
        let (reachable, latency) = self
            .transport
            .probe_health(&node.endpoint)
            .await
            .unwrap_or((false, std::time::Duration::ZERO));

        let status = if !reachable {
            HealthStatus::Unavailable
        } else if latency.as_millis() as i64 > DEGRADED_LATENCY_THRESHOLD_MS {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        metrics::HEALTH_PROBES_TOTAL
            .with_label_values(&[if reachable { "success" } else { "failure" }])
            .inc();
        if reachable {
            metrics::HEALTH_PROBE_LATENCY_SECONDS
                .with_label_values(&[&node.id.to_string()])
                .observe(latency.as_secs_f64());
        }
        metrics::PEER_HEALTH_STATUS
            .with_label_values(&[&node.id.to_string(), &node.name])
            .set(health_status_gauge_value(status));

        let now = Utc::now();
        let mut updated = node.clone();
        updated.health_status = status;
        updated.last_health_check = Some(now);
        updated.latency_ms = Some(latency.as_millis() as i64);

        if reachable {
            updated.last_seen = Some(now);
            updated.is_stale = false;
        } else if let Some(last_seen) = node.last_seen {
            if !node.is_stale && now - last_seen >= self.staleness_threshold().await {
                updated.is_stale = true;
                warn!(node_id = %node.id, node_name = %node.name, "peer marked stale: unreachable past threshold");
            }
        } else if !node.is_stale {
            // Never seen at all: invariant 4 (spec.md §8) is satisfied by
            // staleness with a NULL `last_seen`, but an unseen node has no
            // prior evidence of membership worth reconciling, so we leave
            // it unmarked until a first successful probe establishes one.
        }

        if let Err(e) = self.store.upsert_node(&updated).await {
            warn!(node_id = %node.id, error = %e, "failed to persist health update");
        }

        let history = HealthHistoryEntry {
            id: 0,
            node_id: node.id,
            status,
            latency_ms: Some(latency.as_millis() as i64),
            error_message: if reachable { None } else { Some("probe failed or timed out".into()) },
            recorded_at: now,
        };
        if let Err(e) = self.store.append_health_history(&history).await {
            warn!(node_id = %node.id, error = %e, "failed to append health history");
        }

        reachable
    }

    /// Local-node isolation bookkeeping: if no peer was reachable this
    /// tick, check whether we've been isolated past the staleness
    /// threshold and mark our own row stale; if any peer was reachable
    /// and we were previously marked stale, signal the orchestrator to run
    /// the stale reconciler (spec.md §4.6 "a previously stale local node
    /// sees a successful probe").
    async fn update_self_staleness(&self, any_peer_healthy: bool) {
        let now = Utc::now();
        let self_node = match self.store.get_node(self.local_node_id).await {
            Ok(Some(n)) => n,
            _ => return,
        };

        if any_peer_healthy {
            let _ = self
                .store
                .set_config_value(LAST_PEER_CONTACT_KEY, &now.to_rfc3339())
                .await;
            if self_node.is_stale {
                info!("connectivity to peers restored, signaling stale reconciler");
                let _ = self.reconnect_tx.send(()).await;
            }
            return;
        }

        if self_node.is_stale {
            return;
        }

        let last_contact = match self.store.get_config_value(LAST_PEER_CONTACT_KEY).await {
            Ok(Some(v)) => chrono::DateTime::parse_from_rfc3339(&v).ok().map(|d| d.with_timezone(&Utc)),
            _ => None,
        };

        let isolated_duration = last_contact.map(|c| now - c);
        let threshold = self.staleness_threshold().await;
        if matches!(isolated_duration, Some(d) if d >= threshold) {
            let mut updated = self_node.clone();
            updated.is_stale = true;
            if let Err(e) = self.store.upsert_node(&updated).await {
                warn!(error = %e, "failed to mark local node stale");
            } else {
                warn!("local node marked stale: isolated from all peers past threshold");
            }
        }
    }
}

fn health_status_gauge_value(status: HealthStatus) -> f64 {
    match status {
        HealthStatus::Unknown => 0.0,
        HealthStatus::Healthy => 1.0,
        HealthStatus::Degraded => 2.0,
        HealthStatus::Unavailable => 3.0,
        HealthStatus::Removed => 4.0,
    }
}

async fn read_duration_secs(store: &Store, key: &str, default_secs: u64) -> std::time::Duration {
    match store.get_config_value(key).await {
        Ok(Some(v)) => v.parse().map(std::time::Duration::from_secs).unwrap_or(std::time::Duration::from_secs(default_secs)),
        _ => std::time::Duration::from_secs(default_secs),
    }
}

/// `is_stale = true` must imply the node either was never seen or has been
/// unseen for at least the staleness threshold (spec.md §8 property 4).
pub fn staleness_is_consistent(node: &Node, threshold: chrono::Duration, now: chrono::DateTime<Utc>) -> bool {
    node.staleness_is_consistent(threshold, now)
}

/// A node's retained probe history, most recent first. Exposed for admin
/// tooling (e.g. an operator diagnosing a flapping peer) rather than the
/// background checker itself, which only ever appends.
pub async fn list_stale_history(store: &Store, node_id: Uuid) -> ClusterResult<Vec<HealthHistoryEntry>> {
    store.list_health_history(node_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ReconcileMode;
    use chrono::Duration;

    #[test]
    fn staleness_consistency_holds_for_never_seen_node() {
        let node = Node {
            id: Uuid::new_v4(),
            name: "n".into(),
            endpoint: "https://n".into(),
            node_token: "tok".into(),
            region: "".into(),
            priority: 0,
            health_status: HealthStatus::Unknown,
            last_health_check: None,
            last_seen: None,
            latency_ms: None,
            capacity_bytes: None,
            used_bytes: None,
            is_stale: true,
            last_local_write_at: None,
            metadata: Default::default(),
        };
        assert!(staleness_is_consistent(&node, Duration::days(7), Utc::now()));
        assert_eq!(node.reconcile_mode(), ReconcileMode::Offline);
    }

    #[test]
    fn staleness_consistency_fails_if_marked_too_early() {
        let mut node = Node {
            id: Uuid::new_v4(),
            name: "n".into(),
            endpoint: "https://n".into(),
            node_token: "tok".into(),
            region: "".into(),
            priority: 0,
            health_status: HealthStatus::Unavailable,
            last_health_check: None,
            last_seen: Some(Utc::now() - Duration::hours(1)),
            latency_ms: None,
            capacity_bytes: None,
            used_bytes: None,
            is_stale: true,
            last_local_write_at: None,
            metadata: Default::default(),
        };
        assert!(!staleness_is_consistent(&node, Duration::days(7), Utc::now()));
        node.last_local_write_at = Some(Utc::now());
        assert_eq!(node.reconcile_mode(), ReconcileMode::Partition);
    }
}
