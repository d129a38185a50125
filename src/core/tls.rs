// src/core/tls.rs

//! Certificate minting and the hot-swappable TLS material used for mutual
//! TLS between cluster peers (spec.md §4.11, §6.2, §9).
//!
//! Cert rotation swaps an `ArcSwap<CertifiedNodeKey>` that both the rustls
//! server resolver and the reqwest client identity read from, so the
//! renewal ticker never blocks a reader — the same lock-free handoff
//! pattern the design notes (spec.md §9) describe for "Global mutable
//! state".

use crate::core::errors::{ClusterError, ClusterResult};
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose};
use reqwest::{Certificate, ClientBuilder, Identity};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use std::io::BufReader;
use std::sync::Arc;

/// PEM-encoded internal CA: a 10-year ECDSA P-256 certificate authority
/// minted once at `InitializeCluster` (spec.md §4.11).
#[derive(Clone)]
pub struct ClusterCa {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_after: DateTime<Utc>,
}

impl ClusterCa {
    /// Mints a fresh internal CA, ECDSA P-256, valid for 10 years.
    pub fn generate(common_name: &str) -> ClusterResult<Self> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = epoch_2020();
        let not_after = Utc::now() + Duration::days(3650);
        params.not_after = to_rcgen_time(not_after);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{common_name} Internal CA"));
        params.distinguished_name = dn;

        let cert = params.self_signed(&key_pair)?;
        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            not_after,
        })
    }

    /// Reconstructs a `ClusterCa` handle from PEM material received during
    /// `JoinCluster` (spec.md §4.11) rather than minted locally.
    pub fn from_existing(cert_pem: String, key_pem: String) -> ClusterResult<Self> {
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| ClusterError::Internal(format!("invalid CA cert: {e}")))?;
        let not_after = from_rcgen_time(params.not_after);
        Ok(Self {
            cert_pem,
            key_pem,
            not_after,
        })
    }

    fn signer(&self) -> ClusterResult<rcgen::Issuer<'_, KeyPair>> {
        let key_pair = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| ClusterError::Internal(format!("invalid CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&self.cert_pem)
            .map_err(|e| ClusterError::Internal(format!("invalid CA cert: {e}")))?;
        Ok(rcgen::Issuer::new(params, key_pair))
    }

    /// Mints a 1-year node certificate signed by this CA, with SANs for the
    /// node's DNS name plus `localhost`, `127.0.0.1`, and `::1`
    /// (spec.md §4.11).
    pub fn mint_node_cert(&self, common_name: &str) -> ClusterResult<CertifiedNodeKey> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let sans = vec![
            common_name.to_string(),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ];
        let mut params = CertificateParams::new(sans)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.not_before = epoch_2020();
        let not_after = Utc::now() + Duration::days(365);
        params.not_after = to_rcgen_time(not_after);

        let issuer = self.signer()?;
        let cert = params.signed_by(&key_pair, &issuer)?;
        Ok(CertifiedNodeKey {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            not_after,
        })
    }

    pub fn expires_within(&self, window: Duration) -> bool {
        self.not_after - Utc::now() <= window
    }
}

fn to_rcgen_time(t: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(t.timestamp()).unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
}

fn from_rcgen_time(t: time::OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(t.unix_timestamp(), 0).unwrap_or_else(Utc::now)
}

/// A fixed `not_before` in the past so freshly minted certs are immediately
/// valid regardless of small clock skew between nodes.
fn epoch_2020() -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(1_577_836_800).unwrap() // 2020-01-01T00:00:00Z
}

#[derive(Clone)]
pub struct CertifiedNodeKey {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_after: DateTime<Utc>,
}

/// Hot-swappable TLS material shared across every outbound client and the
/// inbound TLS acceptor. Renewal stores a new `Arc`; readers load without
/// locking.
pub struct ClusterTls {
    ca_cert_pem: String,
    node_key: ArcSwap<CertifiedNodeKey>,
}

impl ClusterTls {
    pub fn new(ca_cert_pem: String, node_key: CertifiedNodeKey) -> Self {
        Self {
            ca_cert_pem,
            node_key: ArcSwap::from_pointee(node_key),
        }
    }

    pub fn current_node_key(&self) -> Arc<CertifiedNodeKey> {
        self.node_key.load_full()
    }

    /// Called by the certificate-renewal ticker (spec.md §4.11) to hot-swap
    /// the node certificate without taking a lock readers would contend on.
    pub fn rotate(&self, new_key: CertifiedNodeKey) {
        self.node_key.store(Arc::new(new_key));
    }

    pub fn needs_renewal(&self, window: Duration) -> bool {
        self.current_node_key().not_after - Utc::now() <= window
    }

    /// Configures a reqwest client for mutual TLS: trusts only the internal
    /// CA and presents the current node certificate/key as its identity.
    pub fn apply_to_reqwest(&self, builder: ClientBuilder) -> ClusterResult<ClientBuilder> {
        let ca = Certificate::from_pem(self.ca_cert_pem.as_bytes())
            .map_err(|e| ClusterError::Internal(format!("invalid CA pem: {e}")))?;
        let key = self.current_node_key();
        let identity_pem = format!("{}{}", key.cert_pem, key.key_pem);
        let identity = Identity::from_pem(identity_pem.as_bytes())
            .map_err(|e| ClusterError::Internal(format!("invalid node identity pem: {e}")))?;

        Ok(builder
            .add_root_certificate(ca)
            .identity(identity)
            .tls_built_in_root_certs(false)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .use_rustls_tls())
    }

    /// Builds the inbound `rustls::ServerConfig` for mutual TLS (spec.md
    /// §6.2): trusts only the internal CA for client certs, requires every
    /// connecting peer to present one, and resolves this node's own
    /// certificate through `ClusterCertResolver` so a renewal takes effect
    /// on the very next handshake without restarting the listener.
    pub fn server_config(self: &Arc<Self>) -> ClusterResult<ServerConfig> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let mut root_store = RootCertStore::empty();
        for cert in parse_certs(&self.ca_cert_pem)? {
            root_store
                .add(cert)
                .map_err(|e| ClusterError::Internal(format!("invalid CA cert in root store: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(root_store), provider.clone())
            .build()
            .map_err(|e| ClusterError::Internal(format!("failed to build client verifier: {e}")))?;

        let resolver: Arc<dyn ResolvesServerCert> = Arc::new(ClusterCertResolver {
            tls: self.clone(),
            provider: provider.clone(),
        });

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ClusterError::Internal(format!("unsupported protocol versions: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(resolver);
        Ok(config)
    }
}

fn parse_certs(pem: &str) -> ClusterResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::Internal(format!("invalid certificate PEM: {e}")))
}

fn parse_private_key(pem: &str) -> ClusterResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClusterError::Internal(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| ClusterError::Internal("no private key found in PEM".into()))
}

/// Re-derives this node's `rustls::sign::CertifiedKey` from whatever
/// `ClusterTls::current_node_key` returns at handshake time, so certificate
/// rotation (spec.md §4.11) is picked up without rebuilding the
/// `ServerConfig` or restarting the listener.
struct ClusterCertResolver {
    tls: Arc<ClusterTls>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl std::fmt::Debug for ClusterCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCertResolver").finish()
    }
}

impl ResolvesServerCert for ClusterCertResolver {
    fn resolve(&self, _client_hello: rustls::server::ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let key = self.tls.current_node_key();
        let chain = parse_certs(&key.cert_pem).ok()?;
        let private_key = parse_private_key(&key.key_pem).ok()?;
        let signing_key = self.provider.key_provider.load_private_key(private_key).ok()?;
        Some(Arc::new(CertifiedKey::new(chain, signing_key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_node_cert_is_signed_by_ca_and_expires_in_a_year() {
        let ca = ClusterCa::generate("maxiofs-test").unwrap();
        let node_key = ca.mint_node_cert("node-1.maxiofs.local").unwrap();
        assert!(node_key.not_after > Utc::now() + Duration::days(300));
        assert!(!ca.expires_within(Duration::days(365 * 5)));
    }

    #[test]
    fn rotate_swaps_without_changing_the_ca() {
        let ca = ClusterCa::generate("maxiofs-test").unwrap();
        let tls = ClusterTls::new(ca.cert_pem.clone(), ca.mint_node_cert("node-1").unwrap());
        let before = tls.current_node_key();
        let after_key = ca.mint_node_cert("node-1").unwrap();
        tls.rotate(after_key);
        let after = tls.current_node_key();
        assert_ne!(before.cert_pem, after.cert_pem);
    }
}
