//! The per-connection proxy state machine (component C5).
//!
//! ```text
//! READ_REQUEST ──absolute-form──► RUN_HOOKS ──► WRITE_RESPONSE ──► CLOSED
//!             ──CONNECT──► REPLY_200 ──► TLS_HANDSHAKE ──► READ_INNER_REQUEST ──► RUN_HOOKS ──► WRITE_RESPONSE ──► CLOSED
//!             ──error──► CLOSED
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{
    AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

use wiretap_core::error::HttpParseError;
use wiretap_core::{BodyReader, Headers, Method, Request, Scheme};
use wiretap_tls::TlsStore;

use crate::error::ProxyError;
use crate::hooks::{ProxyHooks, RequestView};

/// The live handle hooks operate on: the effective request's snapshot plus
/// the ability to stream the body in and the response out. Erasing the
/// connection's concrete transport type behind this trait (rather than
/// parameterizing [`ProxyHooks`] itself) is what lets one hook
/// implementation serve both the direct-proxy and post-`CONNECT` paths,
/// which end up with different reader/writer types once TLS is layered on.
#[async_trait]
pub trait ConnHandle: Send {
    fn request(&self) -> &RequestView;
    fn peer_addr(&self) -> SocketAddr;

    /// Pull the next request body chunk, or `None` once exhausted.
    /// Single-pass: once this yields `None` it must not be called again.
    async fn next_body_chunk(&mut self) -> Option<Result<Bytes, HttpParseError>>;

    /// Buffer bytes for the client; call [`ConnHandle::flush_response`] to
    /// push them out.
    async fn write_response(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    async fn flush_response(&mut self) -> std::io::Result<()>;
}

/// Concrete connection handle. `R` is the buffered reader the request was
/// parsed from (and the request body streams from); `W` is the writer
/// responses are serialized to. For a direct request both halves come
/// from the same client socket; for a `CONNECT` tunnel both are the two
/// halves of the TLS stream layered on top of it.
pub struct Conn<R, W> {
    body: Option<BodyReader<R>>,
    writer: W,
    view: RequestView,
    peer_addr: SocketAddr,
}

#[async_trait]
impl<R, W> ConnHandle for Conn<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn request(&self) -> &RequestView {
        &self.view
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    async fn next_body_chunk(&mut self) -> Option<Result<Bytes, HttpParseError>> {
        match self.body.as_mut() {
            Some(body) => body.next_chunk().await,
            None => None,
        }
    }

    async fn write_response(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await
    }

    async fn flush_response(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }
}

/// Run one accepted connection to completion. Every error is caught here:
/// the connection is always closed, and `on_error` is invoked at most once.
pub async fn run_connection<S>(
    stream: S,
    peer_addr: SocketAddr,
    tls_store: Arc<TlsStore>,
    mut hooks: Box<dyn ProxyHooks>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);

    let (view, body) = match parse_request(reader, Scheme::Http).await {
        Ok(parsed) => parsed,
        Err(e) => {
            let mut dead = Conn {
                body: None::<BodyReader<BufReader<ReadHalf<S>>>>,
                writer: write_half,
                view: empty_view(),
                peer_addr,
            };
            report_error(&mut dead, hooks.as_mut(), ProxyError::ClientParse(e)).await;
            return;
        }
    };

    let mut conn = Conn {
        body: Some(body),
        writer: write_half,
        view,
        peer_addr,
    };

    hooks.on_client_connected(&mut conn).await;

    if conn.view.method.is_connect() {
        handle_connect(conn, tls_store, hooks.as_mut()).await;
    } else {
        hooks.on_request_received(&mut conn).await;
    }
}

async fn handle_connect<S>(
    mut conn: Conn<BufReader<ReadHalf<S>>, WriteHalf<S>>,
    tls_store: Arc<TlsStore>,
    hooks: &mut dyn ProxyHooks,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some((host, _port)) = conn.view.connect_target.clone() else {
        report_error(&mut conn, hooks, ProxyError::MissingHost).await;
        return;
    };

    if conn
        .writer
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
        || conn.writer.flush().await.is_err()
    {
        tracing::debug!(%host, "client gone before CONNECT reply could be sent");
        return;
    }

    let server_config = match tls_store.server_config_for(&host).await {
        Ok(cfg) => cfg,
        Err(source) => {
            report_error(
                &mut conn,
                hooks,
                ProxyError::CertificateIssuance { host, source },
            )
            .await;
            return;
        }
    };

    // From here on the connection is fully consumed: the client socket is
    // about to be reunited and layered with TLS, so there is no meaningful
    // `Conn` to keep around for this transport.
    let Conn {
        body,
        writer,
        view,
        peer_addr,
    } = conn;
    let buf_reader = body
        .expect("CONNECT's request body is always Some right after parsing")
        .into_inner();
    let leftover = Bytes::copy_from_slice(buf_reader.buffer());
    let read_half = buf_reader.into_inner();
    let joined = tokio::io::join(read_half, writer);
    let prefixed = PrefixedStream::new(leftover, joined);

    let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
    let tls_stream = match acceptor.accept(prefixed).await {
        Ok(s) => s,
        Err(e) => {
            // The client already received its 200; log and close silently.
            // No usable writer survived the failed handshake, so
            // `on_error` gets a sink-backed handle purely to carry context.
            let mut dead = dead_handle(view, peer_addr);
            report_error(&mut dead, hooks, ProxyError::TlsHandshake(e.to_string())).await;
            return;
        }
    };

    let (tls_read, tls_write) = tokio::io::split(tls_stream);
    let inner_reader = BufReader::new(tls_read);

    let (inner_view, inner_body) = match parse_request(inner_reader, Scheme::Https).await {
        Ok(parsed) => parsed,
        Err(e) => {
            let mut dead = Conn {
                body: None,
                writer: tls_write,
                view: empty_view(),
                peer_addr,
            };
            report_error(&mut dead, hooks, ProxyError::ClientParse(e)).await;
            return;
        }
    };

    let mut inner_conn = Conn {
        body: Some(inner_body),
        writer: tls_write,
        view: inner_view,
        peer_addr,
    };
    hooks.on_request_received(&mut inner_conn).await;
}

fn dead_handle(
    view: RequestView,
    peer_addr: SocketAddr,
) -> Conn<BufReader<tokio::io::Empty>, tokio::io::Sink> {
    Conn {
        body: None,
        writer: tokio::io::sink(),
        view,
        peer_addr,
    }
}

fn empty_view() -> RequestView {
    RequestView {
        method: Method::parse("GET").expect("GET is a valid token"),
        target: Bytes::new(),
        headers: Headers::new(),
        scheme: Scheme::Http,
        host: None,
        connect_target: None,
    }
}

/// Invoke `on_error`, then — unless the error policy says to close
/// silently — write the default status-coded response, provided the
/// connection hasn't already sent one.
pub(crate) async fn report_error(conn: &mut dyn ConnHandle, hooks: &mut dyn ProxyHooks, err: ProxyError) {
    hooks.on_error(conn, &err).await;
    if let Some((status, reason)) = err.status_line() {
        let body = format!("{status} {reason}\n");
        let _ = write_simple_response(conn, status, reason, body.as_bytes()).await;
    }
}

async fn parse_request<R: AsyncBufRead + Unpin + Send>(
    reader: R,
    scheme: Scheme,
) -> Result<(RequestView, BodyReader<R>), HttpParseError> {
    let mut req = Request::read(reader, scheme).await?;
    let connect_target = req.connect_authority().map(|(h, p)| (h.to_string(), p));
    let host = req.host().map(str::to_string);
    let view = RequestView {
        method: req.method.clone(),
        target: req.target.clone(),
        headers: req.headers.clone(),
        scheme: req.scheme,
        host,
        connect_target,
    };
    let body = req
        .take_body()
        .expect("body is always Some right after parse");
    Ok((view, body))
}

/// Write a simple, fully-buffered response — used for the default error
/// responses.
pub async fn write_simple_response(
    conn: &mut dyn ConnHandle,
    status: u16,
    reason: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let mut headers = Headers::new();
    headers.append("Content-Length", body.len().to_string());
    headers.append("Connection", "close");
    write_response_parts(conn, status, reason, &headers, body).await
}

/// Serialize a status line, headers, and a pre-collected body to `conn`.
pub async fn write_response_parts(
    conn: &mut dyn ConnHandle,
    status: u16,
    reason: &str,
    headers: &Headers,
    body: &[u8],
) -> std::io::Result<()> {
    let mut out = BytesMut::new();
    out.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);

    conn.write_response(&out).await?;
    conn.flush_response().await
}

/// A byte stream with a fixed prefix spliced in front of whatever `inner`
/// produces. Used to hand a TLS acceptor bytes that were already pulled
/// into a `BufReader`'s buffer before the handshake began.
pub struct PrefixedStream<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> PrefixedStream<T> {
    pub fn new(prefix: Bytes, inner: T) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PrefixedStream<T> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<T> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};

    #[tokio::test]
    async fn prefixed_stream_yields_prefix_then_inner_bytes() {
        let inner = std::io::Cursor::new(b"world".to_vec());
        let mut stream = PrefixedStream::new(Bytes::from_static(b"hello "), inner);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn direct_request_runs_on_request_received_once_and_writes_response() {
        use crate::hooks::ProxyHooks;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc as StdArc;

        struct CountingHooks(StdArc<AtomicUsize>);

        #[async_trait]
        impl ProxyHooks for CountingHooks {
            async fn on_request_received(&mut self, conn: &mut dyn ConnHandle) {
                self.0.fetch_add(1, Ordering::SeqCst);
                let _ = write_simple_response(conn, 204, "No Content", b"").await;
            }
        }

        let raw = b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n";
        let (mut client, server) = tokio::io::duplex(4096);
        let tls_store = Arc::new(TlsStore::new().unwrap());
        let count = StdArc::new(AtomicUsize::new(0));
        let hooks = Box::new(CountingHooks(count.clone()));

        let server_task = tokio::spawn(async move {
            run_connection(server, "127.0.0.1:1".parse().unwrap(), tls_store, hooks).await;
        });

        client.write_all(raw).await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 204 No Content"));
    }

    #[tokio::test]
    async fn malformed_request_gets_a_400() {
        let (mut client, server) = tokio::io::duplex(4096);
        let tls_store = Arc::new(TlsStore::new().unwrap());

        struct NoopHooks;
        #[async_trait]
        impl ProxyHooks for NoopHooks {}

        let server_task = tokio::spawn(async move {
            run_connection(server, "127.0.0.1:1".parse().unwrap(), tls_store, Box::new(NoopHooks)).await;
        });

        client.write_all(b"not a request\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        server_task.await.unwrap();

        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400 Bad Request"));
    }
}
