// src/core/breaker.rs

//! Per-peer circuit breaker (C8): shields the bucket aggregator and router
//! from known-bad peers instead of letting every caller re-discover the
//! same timeout.

use crate::core::errors::{ClusterError, ClusterResult};
use crate::core::metrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn as_gauge_value(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// A single peer's breaker. Internal counters are behind a `parking_lot`
/// mutex (spec.md §5: "Circuit breaker internal counters: protected by a
/// per-breaker mutex").
pub struct Breaker {
    peer_id: Uuid,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl Breaker {
    fn new(peer_id: Uuid, config: BreakerConfig) -> Self {
        Self {
            peer_id,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Computes whether an `Open` breaker should transition to `HalfOpen`
    /// now, without holding the lock across the caller's work.
    fn pre_call_state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.open_timeout
        {
            inner.state = BreakerState::HalfOpen;
            inner.consecutive_successes = 0;
        }
        inner.state
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                }
            }
            BreakerState::Open => {}
        }
        metrics::BREAKER_STATE
            .with_label_values(&[&self.peer_id.to_string()])
            .set(inner.state.as_gauge_value());
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    metrics::BREAKER_TRIPS_TOTAL.inc();
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                metrics::BREAKER_TRIPS_TOTAL.inc();
            }
            BreakerState::Open => {}
        }
        metrics::BREAKER_STATE
            .with_label_values(&[&self.peer_id.to_string()])
            .set(inner.state.as_gauge_value());
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Runs `f`, fast-failing with `ClusterError::CircuitOpen` while the
    /// breaker is open (spec.md §4.8).
    pub async fn call<F, Fut, T>(&self, f: F) -> ClusterResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClusterResult<T>>,
    {
        if self.pre_call_state() == BreakerState::Open {
            return Err(ClusterError::CircuitOpen(self.peer_id.to_string()));
        }

        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

/// A registry of one breaker per peer, created lazily on first use.
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<Uuid, Arc<Breaker>>>,
    config: Arc<BreakerConfig>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn get_breaker(&self, peer_id: Uuid) -> Arc<Breaker> {
        self.breakers
            .entry(peer_id)
            .or_insert_with(|| {
                Arc::new(Breaker::new(
                    peer_id,
                    BreakerConfig {
                        failure_threshold: self.config.failure_threshold,
                        success_threshold: self.config.success_threshold,
                        open_timeout: self.config.open_timeout,
                    },
                ))
            })
            .clone()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_failure_threshold_and_fails_fast() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            open_timeout: Duration::from_secs(60),
        });
        let peer = Uuid::new_v4();
        let breaker = registry.get_breaker(peer);

        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), _>(ClusterError::TransportError("boom".into())) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let result = breaker.call(|| async { Ok::<_, ClusterError>(()) }).await;
        assert!(matches!(result, Err(ClusterError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            open_timeout: Duration::from_millis(10),
        });
        let peer = Uuid::new_v4();
        let breaker = registry.get_breaker(peer);

        let _ = breaker
            .call(|| async { Err::<(), _>(ClusterError::TransportError("boom".into())) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        breaker.call(|| async { Ok::<_, ClusterError>(()) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.call(|| async { Ok::<_, ClusterError>(()) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            open_timeout: Duration::from_millis(10),
        });
        let peer = Uuid::new_v4();
        let breaker = registry.get_breaker(peer);

        let _ = breaker
            .call(|| async { Err::<(), _>(ClusterError::TransportError("boom".into())) })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = breaker
            .call(|| async { Err::<(), _>(ClusterError::TransportError("still broken".into())) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
