// tests/integration_test.rs

//! Integration tests for the cluster control plane.
//!
//! Each scenario spins up two or three real nodes — an in-memory `Store`
//! plus the actual `internal_api` axum router bound to an ephemeral TCP
//! port — and drives them over real HTTP, the same way the sync manager,
//! stale reconciler, and join handshake do in production. No handler is
//! called directly; everything goes through the wire so HMAC signing,
//! routing, and status-code mapping are exercised along with the LWW and
//! tombstone logic they guard.

mod integration {
    pub mod helpers;
    pub mod reconcile_test;
    pub mod sync_test;
    pub mod tombstone_test;
}
