use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsStoreError {
    #[error("failed to generate CA: {0}")]
    CaGeneration(String),
    #[error("failed to load CA: {0}")]
    CaLoad(String),
    #[error("loaded CA key is not EC P-256")]
    UnsupportedKeyAlgorithm,
    #[error("loaded CA certificate is missing CA:TRUE basic constraints")]
    NotACertificateAuthority,
    #[error("failed to issue leaf certificate for {host}: {source}")]
    LeafIssuance { host: String, source: String },
    #[error("failed to build TLS server config: {0}")]
    ServerConfig(String),
    #[error("failed to persist CA material: {0}")]
    Persist(#[from] std::io::Error),
}
