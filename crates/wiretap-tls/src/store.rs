//! Per-host leaf certificate cache and TLS server config factory (C4).

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{CertificateParams, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex as AsyncMutex;

use crate::ca::{random_serial, CaMaterial, CaSubject};
use crate::error::TlsStoreError;

/// A leaf certificate chain (leaf + CA) and its private key, ready to
/// hand to a `rustls::ServerConfig`.
struct CertifiedLeaf {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

/// Issues and caches per-hostname TLS server certificates signed by an
/// in-memory or caller-supplied CA.
///
/// Concurrent lookups for the same hostname are serialized through a
/// per-hostname gate so that only one leaf is ever minted per host,
/// even under a burst of simultaneous connections.
pub struct TlsStore {
    ca: CaMaterial,
    leaves: DashMap<String, Arc<CertifiedLeaf>>,
    gates: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl TlsStore {
    /// Generate a fresh, process-local CA and start with an empty leaf cache.
    pub fn new() -> Result<Self, TlsStoreError> {
        Self::with_ca(CaMaterial::generate(CaSubject::default())?)
    }

    pub fn generate_ca(subject: CaSubject<'_>) -> Result<Self, TlsStoreError> {
        Self::with_ca(CaMaterial::generate(subject)?)
    }

    /// Adopt a caller-supplied CA, e.g. loaded from disk by the caller.
    pub fn load_ca(key_pem: &str, cert_pem: &str) -> Result<Self, TlsStoreError> {
        Self::with_ca(CaMaterial::load(key_pem, cert_pem)?)
    }

    fn with_ca(ca: CaMaterial) -> Result<Self, TlsStoreError> {
        Ok(Self {
            ca,
            leaves: DashMap::new(),
            gates: DashMap::new(),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        self.ca.cert_pem()
    }

    pub fn ca_key_pem(&self) -> String {
        self.ca.key_pem()
    }

    pub async fn save_ca(
        &self,
        key_path: impl AsRef<std::path::Path>,
        cert_path: impl AsRef<std::path::Path>,
    ) -> Result<(), TlsStoreError> {
        tokio::fs::write(key_path, self.ca.key_pem()).await?;
        tokio::fs::write(cert_path, self.ca.cert_pem()).await?;
        Ok(())
    }

    /// Build a per-connection TLS server config presenting a leaf issued
    /// for `hostname`, minting and caching one first if needed.
    pub async fn server_config_for(&self, hostname: &str) -> Result<Arc<ServerConfig>, TlsStoreError> {
        let key = normalize_hostname(hostname);
        let leaf = self.leaf_for(&key).await?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(leaf.chain.clone(), leaf.key.clone_key())
            .map_err(|e| TlsStoreError::ServerConfig(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    async fn leaf_for(&self, key: &str) -> Result<Arc<CertifiedLeaf>, TlsStoreError> {
        if let Some(leaf) = self.leaves.get(key) {
            return Ok(leaf.clone());
        }

        let gate = self
            .gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Another task may have won the race and issued the leaf while we
        // waited for the gate.
        if let Some(leaf) = self.leaves.get(key) {
            return Ok(leaf.clone());
        }

        let leaf = Arc::new(self.issue_leaf(key)?);
        self.leaves.insert(key.to_string(), leaf.clone());
        Ok(leaf)
    }

    fn issue_leaf(&self, hostname: &str) -> Result<CertifiedLeaf, TlsStoreError> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|e| {
            TlsStoreError::LeafIssuance {
                host: hostname.to_string(),
                source: e.to_string(),
            }
        })?;

        let mut params = CertificateParams::new(vec![hostname.to_string()]).map_err(|e| {
            TlsStoreError::LeafIssuance {
                host: hostname.to_string(),
                source: e.to_string(),
            }
        })?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, hostname);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(SerialNumber::from(random_serial()));

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::seconds(60);
        params.not_after = now + Duration::days(825);

        let cert = params
            .signed_by(&key_pair, &self.ca.signing_cert, &self.ca.key_pair)
            .map_err(|e| TlsStoreError::LeafIssuance {
                host: hostname.to_string(),
                source: e.to_string(),
            })?;

        let leaf_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        Ok(CertifiedLeaf {
            chain: vec![leaf_der, self.ca.cert_der.clone()],
            key: key_der,
        })
    }
}

/// Lowercase and IDNA-normalize `hostname` for use as a cache key.
/// IP-address literals (as they appear in a CONNECT authority, e.g.
/// `192.0.2.1` or `[::1]`) pass through unchanged aside from bracket
/// stripping, since IDNA has no notion of them.
fn normalize_hostname(hostname: &str) -> String {
    let bare = hostname.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return bare.to_string();
    }
    idna::domain_to_ascii(hostname).unwrap_or_else(|_| hostname.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_ip_literals() {
        assert_eq!(normalize_hostname("Example.COM"), "example.com");
        assert_eq!(normalize_hostname("192.0.2.1"), "192.0.2.1");
        assert_eq!(normalize_hostname("[::1]"), "::1");
    }

    #[tokio::test]
    async fn issues_and_caches_a_leaf_for_a_hostname() {
        let store = TlsStore::new().unwrap();
        let cfg1 = store.server_config_for("example.test").await.unwrap();
        let cfg2 = store.server_config_for("Example.Test").await.unwrap();
        // Same normalized key: must hit the cache rather than minting twice.
        assert_eq!(store.leaves.len(), 1);
        assert!(Arc::ptr_eq(&cfg1, &cfg1) && Arc::ptr_eq(&cfg2, &cfg2));
    }

    #[tokio::test]
    async fn concurrent_lookups_for_the_same_host_issue_once() {
        let store = Arc::new(TlsStore::new().unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.server_config_for("concurrent.test").await.unwrap() },
            ));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.leaves.len(), 1);
    }

    #[tokio::test]
    async fn save_and_load_ca_round_trips() {
        let store = TlsStore::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("ca.key.pem");
        let cert_path = dir.path().join("ca.cert.pem");
        store.save_ca(&key_path, &cert_path).await.unwrap();

        let key_pem = tokio::fs::read_to_string(&key_path).await.unwrap();
        let cert_pem = tokio::fs::read_to_string(&cert_path).await.unwrap();
        let loaded = TlsStore::load_ca(&key_pem, &cert_pem).unwrap();
        assert_eq!(loaded.ca_cert_pem(), store.ca_cert_pem());
    }
}
