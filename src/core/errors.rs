// src/core/errors.rs

//! Defines the primary error type for the cluster control plane.

use thiserror::Error;

/// The main error enum for every control-plane operation. Using `thiserror`
/// gives clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("authentication failed: {0}")]
    AuthError(String),

    #[error("conflict: {0}")]
    ConflictError(String),

    #[error("circuit open for peer {0}")]
    CircuitOpen(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("no healthy node available for bucket {0}")]
    NoHealthyNode(String),

    #[error("cluster already initialized")]
    AlreadyInitialized,

    #[error("cluster is not enabled on this node")]
    ClusterDisabled,
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Internal(format!("io error: {e}"))
    }
}

impl From<sqlx::Error> for ClusterError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ClusterError::NotFound("row not found".into()),
            other => ClusterError::Internal(format!("database error: {other}")),
        }
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(e: reqwest::Error) -> Self {
        ClusterError::TransportError(e.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Internal(format!("serialization error: {e}"))
    }
}

impl From<uuid::Error> for ClusterError {
    fn from(e: uuid::Error) -> Self {
        ClusterError::Internal(format!("invalid uuid: {e}"))
    }
}

impl From<rcgen::Error> for ClusterError {
    fn from(e: rcgen::Error) -> Self {
        ClusterError::Internal(format!("certificate error: {e}"))
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
