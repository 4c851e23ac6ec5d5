//! The hook contract: a capability set supplied by the caller instead of
//! a subclass-and-override pattern.

use async_trait::async_trait;
use bytes::Bytes;
use wiretap_core::{Headers, Method, Scheme};

use crate::connection::ConnHandle;
use crate::error::ProxyError;

/// A snapshot of the effective (post-TLS-upgrade, where applicable) request,
/// handed to hooks alongside the live [`ConnHandle`]. Taken once, right
/// after C2 finishes parsing — headers are frozen from this point on.
#[derive(Debug, Clone)]
pub struct RequestView {
    pub method: Method,
    pub target: bytes::Bytes,
    pub headers: Headers,
    pub scheme: Scheme,
    pub host: Option<String>,
    /// `(host, port)` parsed from a `CONNECT` target's authority; `None`
    /// for every other method.
    pub connect_target: Option<(String, u16)>,
}

impl RequestView {
    /// Reconstruct an absolute URL the way [`wiretap_core::Request::url`] does.
    pub fn url(&self) -> Option<String> {
        let target = std::str::from_utf8(&self.target).ok()?;
        if target.starts_with("http://") || target.starts_with("https://") {
            return Some(target.to_string());
        }
        let host = self.host.as_deref()?;
        Some(format!("{}://{}{}", self.scheme.as_str(), host, target))
    }
}

/// The upstream status line and headers, mutable so [`ProxyHooks::on_response_received`]
/// can rewrite them before they are serialized to the client.
#[derive(Debug, Clone)]
pub struct ResponseView {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Lifecycle hooks for a single connection. Every method defaults to a
/// no-op (or identity, for `on_response_chunk`) so a user only overrides
/// what they need — a capability set a caller implements, rather than a
/// base class the caller subclasses and overrides.
///
/// Implementations are invoked through `&mut dyn ConnHandle` rather than
/// a type parameterized by the connection's transport, so one
/// implementation (e.g. [`crate::forward::ForwardingHooks`]) works
/// unmodified whether the connection is a plain HTTP proxy request or one
/// freshly upgraded out of a `CONNECT` TLS tunnel.
#[async_trait]
pub trait ProxyHooks: Send {
    /// Called once per connection as soon as the outer request's request
    /// line and headers are parsed, before the `CONNECT`-vs-direct branch
    /// is taken. Informational only — the scheme is not yet resolved.
    async fn on_client_connected(&mut self, _conn: &mut dyn ConnHandle) {}

    /// Called once the effective request is parsed — after the TLS
    /// upgrade for a `CONNECT` tunnel, or immediately for a direct
    /// absolute-form request. The base handler's default does nothing;
    /// implementers write a response themselves via `conn.write_response`.
    async fn on_request_received(&mut self, _conn: &mut dyn ConnHandle) {}

    /// Called by the forward handler once the upstream status line and
    /// headers are parsed, before they're serialized to the client.
    /// `response.headers` may be mutated in place.
    async fn on_response_received(&mut self, _conn: &mut dyn ConnHandle, _response: &mut ResponseView) {
    }

    /// Called by the forward handler for each upstream body chunk. The
    /// returned bytes are what gets written to the client; an empty
    /// return emits nothing for that chunk. Defaults to the identity.
    async fn on_response_chunk(&mut self, _conn: &mut dyn ConnHandle, chunk: Bytes) -> Bytes {
        chunk
    }

    /// Called by the forward handler once the response body is fully
    /// streamed (or immediately, for a response with no body).
    async fn on_response_complete(&mut self, _conn: &mut dyn ConnHandle) {}

    /// Called for any unhandled error raised during the connection's
    /// lifecycle. The default logs; it never sees a `ClientParse` or
    /// `TlsHandshake` error before the connection state machine has
    /// already decided how to close, since those happen before a
    /// connection handle exists.
    async fn on_error(&mut self, _conn: &mut dyn ConnHandle, err: &ProxyError) {
        tracing::warn!(error = %err, "connection error");
    }
}
