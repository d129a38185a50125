// src/core/aggregator.rs

//! The bucket aggregator (C10): fans a `ListAllBuckets` call out across
//! every healthy peer, shielded by that peer's circuit breaker, and merges
//! the results with the local listing always first (spec.md §4.10).

use crate::core::breaker::BreakerRegistry;
use crate::core::errors::ClusterResult;
use crate::core::store::Store;
use crate::core::transport::SharedTransport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// One row of the aggregate listing, annotated with where it lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketWithLocation {
    pub bucket: String,
    pub tenant_id: Option<Uuid>,
    pub node_id: Uuid,
    pub node_name: String,
    pub node_status: NodeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Local,
    Remote,
}

/// The boundary to the bucket-metadata service for listing (spec.md §1
/// "Out of scope: the bucket-metadata service"). This crate only needs the
/// local listing; remote listings go over the wire to each peer.
#[async_trait]
pub trait LocalBucketLister: Send + Sync {
    async fn list_local_buckets(&self, tenant: Option<Uuid>) -> ClusterResult<Vec<String>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteBucketEntry {
    bucket: String,
    tenant_id: Option<Uuid>,
}

pub struct BucketAggregator {
    store: Store,
    transport: SharedTransport,
    breakers: BreakerRegistry,
    lister: Arc<dyn LocalBucketLister>,
    local_node_id: Uuid,
    local_node_name: String,
}

impl BucketAggregator {
    pub fn new(
        store: Store,
        transport: SharedTransport,
        breakers: BreakerRegistry,
        lister: Arc<dyn LocalBucketLister>,
        local_node_id: Uuid,
        local_node_name: String,
    ) -> Self {
        Self {
            store,
            transport,
            breakers,
            lister,
            local_node_id,
            local_node_name,
        }
    }

    /// `ListAllBuckets(ctx, tenant)` (spec.md §4.10). Local buckets are
    /// always present and always come first; peer failures degrade the
    /// result to a warning, never an error.
    pub async fn list_all(&self, tenant: Option<Uuid>) -> ClusterResult<Vec<BucketWithLocation>> {
        let mut results: Vec<BucketWithLocation> = self
            .lister
            .list_local_buckets(tenant)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "local bucket listing failed, returning empty local set");
                Vec::new()
            })
            .into_iter()
            .map(|bucket| BucketWithLocation {
                bucket,
                tenant_id: tenant,
                node_id: self.local_node_id,
                node_name: self.local_node_name.clone(),
                node_status: NodeStatus::Local,
            })
            .collect();

        let peers = self.store.list_healthy_peers(self.local_node_id).await?;
        if peers.is_empty() {
            return Ok(results);
        }

        let started = Instant::now();
        let mut tasks = Vec::with_capacity(peers.len());
        for peer in peers {
            let transport = self.transport.clone();
            let breaker = self.breakers.get_breaker(peer.id);
            let tenant_query = tenant;
            let peer_id = peer.id;
            let peer_name = peer.name.clone();
            let endpoint = peer.endpoint.clone();
            tasks.push(tokio::spawn(async move {
                let result = breaker
                    .call(|| query_bucket_from_node(&transport, &endpoint, tenant_query))
                    .await;
                (peer_id, peer_name, result)
            }));
        }

        for task in tasks {
            match task.await {
                Ok((peer_id, peer_name, Ok(entries))) => {
                    results.extend(entries.into_iter().map(|e| BucketWithLocation {
                        bucket: e.bucket,
                        tenant_id: e.tenant_id,
                        node_id: peer_id,
                        node_name: peer_name.clone(),
                        node_status: NodeStatus::Remote,
                    }));
                }
                Ok((peer_id, peer_name, Err(e))) => {
                    warn!(peer = %peer_id, peer_name = %peer_name, error = %e, "bucket query failed, returning partial results");
                }
                Err(e) => {
                    warn!(error = %e, "bucket query task panicked");
                }
            }
        }

        crate::core::metrics::BUCKET_AGGREGATE_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
        Ok(results)
    }
}

async fn query_bucket_from_node(
    transport: &SharedTransport,
    endpoint: &str,
    tenant: Option<Uuid>,
) -> ClusterResult<Vec<RemoteBucketEntry>> {
    let url = match tenant {
        Some(t) => format!("{}/api/internal/cluster/buckets?tenant={}", endpoint.trim_end_matches('/'), t),
        None => format!("{}/api/internal/cluster/buckets", endpoint.trim_end_matches('/')),
    };
    transport.get_json(&url).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::breaker::BreakerConfig;

    struct FakeLister {
        buckets: Vec<String>,
    }

    #[async_trait]
    impl LocalBucketLister for FakeLister {
        async fn list_local_buckets(&self, _tenant: Option<Uuid>) -> ClusterResult<Vec<String>> {
            Ok(self.buckets.clone())
        }
    }

    #[tokio::test]
    async fn no_peers_returns_local_only() {
        let store = Store::connect_in_memory().await.unwrap();
        let local_id = Uuid::new_v4();
        let transport = Arc::new(crate::core::transport::SignedTransport::new(local_id, "tok".into(), None).unwrap());
        let lister = Arc::new(FakeLister {
            buckets: vec!["a".into(), "b".into()],
        });
        let aggregator = BucketAggregator::new(
            store,
            transport,
            BreakerRegistry::new(BreakerConfig::default()),
            lister,
            local_id,
            "self".into(),
        );

        let results = aggregator.list_all(None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|b| b.node_status == NodeStatus::Local));
    }

    #[tokio::test]
    async fn local_listing_failure_still_returns_empty_not_error() {
        struct FailingLister;
        #[async_trait]
        impl LocalBucketLister for FailingLister {
            async fn list_local_buckets(&self, _tenant: Option<Uuid>) -> ClusterResult<Vec<String>> {
                Err(crate::core::errors::ClusterError::Internal("boom".into()))
            }
        }

        let store = Store::connect_in_memory().await.unwrap();
        let local_id = Uuid::new_v4();
        let transport = Arc::new(crate::core::transport::SignedTransport::new(local_id, "tok".into(), None).unwrap());
        let aggregator = BucketAggregator::new(
            store,
            transport,
            BreakerRegistry::new(BreakerConfig::default()),
            Arc::new(FailingLister),
            local_id,
            "self".into(),
        );

        let results = aggregator.list_all(None).await.unwrap();
        assert!(results.is_empty());
    }
}
