use thiserror::Error;

/// Errors surfaced while parsing an HTTP/1.1 request or response off the
/// wire. Every parse failure is fatal to the connection.
#[derive(Debug, Error)]
pub enum HttpParseError {
    #[error("request line exceeds the 8 KiB limit")]
    RequestLineTooLarge,
    #[error("request or status headers exceed the 64 KiB limit")]
    HeadersTooLarge,
    #[error("malformed request or status line")]
    MalformedRequestLine,
    #[error("malformed header line")]
    MalformedHeaderLine,
    #[error("duplicate Host header")]
    DuplicateHostHeader,
    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),
    #[error("invalid or conflicting Content-Length")]
    InvalidContentLength,
    #[error("malformed chunked transfer encoding")]
    MalformedChunk,
    #[error("connection closed before the message was fully read")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
