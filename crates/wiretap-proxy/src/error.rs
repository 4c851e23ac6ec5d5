use thiserror::Error;

use wiretap_core::error::HttpParseError;
use wiretap_tls::TlsStoreError;

/// Every variant maps to a status code the connection writes back to the
/// client (or, for the TLS/disconnect cases, to silent closure) at the
/// single catch point, [`crate::connection::report_error`].
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed client request: {0}")]
    ClientParse(#[from] HttpParseError),

    #[error("client disconnected mid-exchange")]
    ClientDisconnected,

    #[error("TLS handshake with the client failed: {0}")]
    TlsHandshake(String),

    #[error("failed to mint a TLS certificate for {host}: {source}")]
    CertificateIssuance { host: String, source: TlsStoreError },

    #[error("failed to resolve upstream host {host}: {source}")]
    UpstreamResolve {
        host: String,
        source: std::io::Error,
    },

    #[error("failed to connect to upstream {host}:{port}: {source}")]
    UpstreamConnect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("upstream TLS handshake with {host} failed: {source}")]
    UpstreamTls { host: String, source: String },

    #[error("writing to upstream {host} failed: {source}")]
    UpstreamWrite { host: String, source: std::io::Error },

    #[error("malformed upstream response: {0}")]
    UpstreamParse(HttpParseError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("request has no resolvable host")]
    MissingHost,

    #[error("user handler failed: {0}")]
    UserHandler(String),
}

impl ProxyError {
    /// The status line (sans CRLF) the error policy writes for this
    /// error, or `None` when the connection must simply be closed without
    /// a response (TLS handshake failures, a client that is already gone).
    pub fn status_line(&self) -> Option<(u16, &'static str)> {
        match self {
            ProxyError::ClientParse(_) => Some((400, "Bad Request")),
            ProxyError::MissingHost => Some((400, "Bad Request")),
            ProxyError::UpstreamResolve { .. } => Some((502, "Bad Gateway")),
            ProxyError::UpstreamConnect { .. } => Some((502, "Bad Gateway")),
            ProxyError::UpstreamTls { .. } => Some((502, "Bad Gateway")),
            ProxyError::UpstreamWrite { .. } => Some((502, "Bad Gateway")),
            ProxyError::UpstreamParse(_) => Some((502, "Bad Gateway")),
            ProxyError::Timeout(_) => Some((504, "Gateway Timeout")),
            ProxyError::UserHandler(_) => Some((500, "Internal Server Error")),
            ProxyError::TlsHandshake(_) => None,
            ProxyError::ClientDisconnected => None,
            ProxyError::CertificateIssuance { .. } => None,
        }
    }
}
