// src/lib.rs

//! Library surface for the MaxIOFS cluster control plane. A data-plane node
//! process embeds this crate directly: it owns the `ClusterOrchestrator`,
//! serves the internal HTTP API, and calls into `core::router`/`core::aggregator`
//! to resolve and list buckets across the cluster.

pub mod config;
pub mod core;
pub mod server;

pub use crate::config::ClusterRuntimeConfig;
pub use crate::core::errors::{ClusterError, ClusterResult};
pub use crate::core::orchestrator::ClusterOrchestrator;
