// src/core/router.rs

//! The bucket-location router (C9): resolves `bucket -> (owning node |
//! local)` for the data plane. The actual bucket/replication metadata lives
//! outside this crate (spec.md §1 "Out of scope: the bucket-metadata
//! service") — `BucketLocator` is the narrow contract this module consumes
//! instead of reaching into that service directly.

use crate::core::errors::{ClusterError, ClusterResult};
use crate::core::metrics;
use crate::core::model::Node;
use crate::core::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Where a bucket's object data can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Local,
    Remote(Uuid),
}

/// The boundary to the bucket-metadata service: existence checks, the
/// declared primary, and the replica set derived from replication rules.
/// Implemented by the data plane; this crate only calls it.
#[async_trait]
pub trait BucketLocator: Send + Sync {
    async fn exists_locally(&self, bucket: &str) -> ClusterResult<bool>;
    async fn primary_node(&self, bucket: &str) -> ClusterResult<Option<Uuid>>;
    async fn replica_nodes(&self, bucket: &str) -> ClusterResult<Vec<Uuid>>;
}

struct CacheEntry {
    node: RouteTarget,
    cached_at: Instant,
}

/// Resolves bucket locations with an in-memory, TTL'd, concurrency-safe
/// cache (spec.md §4.9 "the cache is safe for concurrent access; cache
/// writes are last-write-wins on conflict") backed by `DashMap`, the same
/// primitive the breaker registry uses for its per-peer map.
pub struct BucketRouter {
    store: Store,
    locator: Arc<dyn BucketLocator>,
    local_node_id: Uuid,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl BucketRouter {
    pub fn new(store: Store, locator: Arc<dyn BucketLocator>, local_node_id: Uuid, ttl: Duration) -> Self {
        Self {
            store,
            locator,
            local_node_id,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// `RouteRequest` (spec.md §4.9).
    pub async fn route(&self, bucket: &str) -> ClusterResult<RouteTarget> {
        let cfg = self.store.get_cluster_config().await?;
        if !cfg.map(|c| c.is_cluster_enabled).unwrap_or(false) {
            return Ok(RouteTarget::Local);
        }

        if let Some(entry) = self.cache.get(bucket) {
            if entry.cached_at.elapsed() < self.ttl {
                match entry.node {
                    RouteTarget::Local => {
                        metrics::BUCKET_ROUTE_CACHE_HITS_TOTAL.inc();
                        return Ok(RouteTarget::Local);
                    }
                    RouteTarget::Remote(node_id) => {
                        if let Some(node) = self.healthy_registered_node(node_id).await? {
                            metrics::BUCKET_ROUTE_CACHE_HITS_TOTAL.inc();
                            return Ok(RouteTarget::Remote(node.id));
                        }
                        // falls through to re-resolve below
                    }
                }
            }
        }
        drop(self.cache.remove(bucket));
        metrics::BUCKET_ROUTE_CACHE_MISSES_TOTAL.inc();

        if self.locator.exists_locally(bucket).await? {
            self.insert_cache(bucket, RouteTarget::Local);
            return Ok(RouteTarget::Local);
        }

        let node_id = self.healthy_node_for_bucket(bucket).await?;
        self.insert_cache(bucket, RouteTarget::Remote(node_id));
        Ok(RouteTarget::Remote(node_id))
    }

    /// `GetHealthyNodeForBucket` (spec.md §4.9 step 4): primary first, else
    /// the first healthy replica, else `NoHealthyNode`.
    async fn healthy_node_for_bucket(&self, bucket: &str) -> ClusterResult<Uuid> {
        if let Some(primary) = self.locator.primary_node(bucket).await? {
            if let Some(node) = self.healthy_registered_node(primary).await? {
                return Ok(node.id);
            }
        }

        for replica in self.locator.replica_nodes(bucket).await? {
            if let Some(node) = self.healthy_registered_node(replica).await? {
                return Ok(node.id);
            }
        }

        Err(ClusterError::NoHealthyNode(bucket.to_string()))
    }

    async fn healthy_registered_node(&self, node_id: Uuid) -> ClusterResult<Option<Node>> {
        Ok(self
            .store
            .get_node(node_id)
            .await?
            .filter(|n| n.id != self.local_node_id)
            .filter(|n| matches!(n.health_status, crate::core::model::HealthStatus::Healthy | crate::core::model::HealthStatus::Degraded))
            .filter(|n| !n.is_stale))
    }

    fn insert_cache(&self, bucket: &str, target: RouteTarget) {
        self.cache.insert(
            bucket.to_string(),
            CacheEntry {
                node: target,
                cached_at: Instant::now(),
            },
        );
        if let RouteTarget::Remote(node_id) = target {
            let store = self.store.clone();
            let bucket = bucket.to_string();
            let ttl = self.ttl;
            tokio::spawn(async move {
                let _ = store
                    .cache_bucket_location(&bucket, node_id, Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
                    .await;
            });
        }
    }

    /// `InvalidateCache(bucket)` (spec.md §4.9).
    pub async fn invalidate(&self, bucket: &str) {
        self.cache.remove(bucket);
        let _ = self.store.invalidate_bucket_location(bucket).await;
    }

    /// `GetBucketReplicas` (spec.md §4.9): intersects replication
    /// destinations with the node registry.
    pub async fn replicas(&self, bucket: &str) -> ClusterResult<Vec<Node>> {
        let mut out = Vec::new();
        for node_id in self.locator.replica_nodes(bucket).await? {
            if let Some(node) = self.store.get_node(node_id).await? {
                out.push(node);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::HealthStatus;

    struct FakeLocator {
        local_buckets: Vec<String>,
        primaries: std::collections::HashMap<String, Uuid>,
    }

    #[async_trait]
    impl BucketLocator for FakeLocator {
        async fn exists_locally(&self, bucket: &str) -> ClusterResult<bool> {
            Ok(self.local_buckets.contains(&bucket.to_string()))
        }
        async fn primary_node(&self, bucket: &str) -> ClusterResult<Option<Uuid>> {
            Ok(self.primaries.get(bucket).copied())
        }
        async fn replica_nodes(&self, _bucket: &str) -> ClusterResult<Vec<Uuid>> {
            Ok(Vec::new())
        }
    }

    fn node(id: Uuid, status: HealthStatus) -> Node {
        Node {
            id,
            name: "peer".into(),
            endpoint: "https://peer".into(),
            node_token: "tok".into(),
            region: "".into(),
            priority: 0,
            health_status: status,
            last_health_check: None,
            last_seen: None,
            latency_ms: None,
            capacity_bytes: None,
            used_bytes: None,
            is_stale: false,
            last_local_write_at: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn local_bucket_routes_local() {
        let store = Store::connect_in_memory().await.unwrap();
        let local_id = Uuid::new_v4();
        store
            .put_cluster_config(&crate::core::model::ClusterConfig {
                node_id: local_id,
                node_name: "self".into(),
                cluster_token: "tok".into(),
                is_cluster_enabled: true,
                region: "".into(),
                ca_cert_pem: "".into(),
                ca_key_pem: "".into(),
                node_cert_pem: "".into(),
                node_key_pem: "".into(),
            })
            .await
            .unwrap();

        let locator = Arc::new(FakeLocator {
            local_buckets: vec!["mine".into()],
            primaries: Default::default(),
        });
        let router = BucketRouter::new(store, locator, local_id, Duration::from_secs(300));
        let target = router.route("mine").await.unwrap();
        assert_eq!(target, RouteTarget::Local);
    }

    #[tokio::test]
    async fn remote_bucket_routes_to_healthy_primary() {
        let store = Store::connect_in_memory().await.unwrap();
        let local_id = Uuid::new_v4();
        let primary_id = Uuid::new_v4();
        store
            .put_cluster_config(&crate::core::model::ClusterConfig {
                node_id: local_id,
                node_name: "self".into(),
                cluster_token: "tok".into(),
                is_cluster_enabled: true,
                region: "".into(),
                ca_cert_pem: "".into(),
                ca_key_pem: "".into(),
                node_cert_pem: "".into(),
                node_key_pem: "".into(),
            })
            .await
            .unwrap();
        store.upsert_node(&node(primary_id, HealthStatus::Healthy)).await.unwrap();

        let mut primaries = std::collections::HashMap::new();
        primaries.insert("theirs".to_string(), primary_id);
        let locator = Arc::new(FakeLocator {
            local_buckets: vec![],
            primaries,
        });
        let router = BucketRouter::new(store, locator, local_id, Duration::from_secs(300));
        let target = router.route("theirs").await.unwrap();
        assert_eq!(target, RouteTarget::Remote(primary_id));
    }

    #[tokio::test]
    async fn no_healthy_node_errors() {
        let store = Store::connect_in_memory().await.unwrap();
        let local_id = Uuid::new_v4();
        store
            .put_cluster_config(&crate::core::model::ClusterConfig {
                node_id: local_id,
                node_name: "self".into(),
                cluster_token: "tok".into(),
                is_cluster_enabled: true,
                region: "".into(),
                ca_cert_pem: "".into(),
                ca_key_pem: "".into(),
                node_cert_pem: "".into(),
                node_key_pem: "".into(),
            })
            .await
            .unwrap();

        let locator = Arc::new(FakeLocator {
            local_buckets: vec![],
            primaries: Default::default(),
        });
        let router = BucketRouter::new(store, locator, local_id, Duration::from_secs(300));
        let err = router.route("nowhere").await.unwrap_err();
        assert!(matches!(err, ClusterError::NoHealthyNode(_)));
    }
}
