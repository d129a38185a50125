// src/server/mod.rs

//! Binds the internal cluster API to a listener, serving plain HTTP when no
//! cluster TLS material is loaded yet and mutual TLS once it is — mirroring
//! the teacher's `server::run` top-level shape (accept loop driven by a
//! shared shutdown signal) without the per-connection RESP dispatch that
//! shape existed for.

pub mod internal_api;

use crate::core::aggregator::LocalBucketLister;
use crate::core::orchestrator::ClusterHandle;
use crate::core::tls::ClusterTls;
use anyhow::{Context, Result};
use internal_api::ApiState;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

pub use internal_api::build_router;

/// Serves the internal API on `listen_addr` until `stop` fires.
pub async fn run(
    listen_addr: &str,
    handle: ClusterHandle,
    lister: Option<Arc<dyn LocalBucketLister>>,
    require_mtls: bool,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let tls = handle.tls.clone();
    let state = ApiState { handle, lister };
    let app = build_router(state);

    match tls {
        Some(tls) if require_mtls => {
            info!(%listen_addr, "internal cluster API listening (mutual TLS)");
            let listener = TlsListener::bind(listen_addr, tls)
                .await
                .with_context(|| format!("failed to bind TLS listener on {listen_addr}"))?;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.changed().await;
                })
                .await
                .context("internal API server failed")
        }
        _ => {
            info!(%listen_addr, "internal cluster API listening (plaintext, no cluster TLS material loaded yet)");
            let listener = TcpListener::bind(listen_addr)
                .await
                .with_context(|| format!("failed to bind internal API listener on {listen_addr}"))?;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.changed().await;
                })
                .await
                .context("internal API server failed")
        }
    }
}

/// An `axum::serve::Listener` that terminates mutual TLS on every accepted
/// connection before handing the decrypted stream to axum, re-deriving the
/// server certificate each handshake through `ClusterTls::server_config`
/// (so cert rotation — spec.md §4.11 — takes effect without rebinding).
/// Failed handshakes are logged and skipped rather than returned, matching
/// how `axum::serve`'s own `TcpListener` impl swallows transient accept
/// errors and keeps looping.
struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    async fn bind(addr: &str, tls: Arc<ClusterTls>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let server_config = tls.server_config().context("failed to build TLS server config")?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
        })
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept TCP connection");
                    continue;
                }
            };

            match self.acceptor.accept(stream).await {
                Ok(tls_stream) => return (tls_stream, addr),
                Err(e) => {
                    warn!(%addr, error = %e, "TLS handshake failed");
                    continue;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.listener.local_addr()
    }
}
