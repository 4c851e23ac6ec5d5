//! The server entrypoint (component C7): bind a listener, spawn one
//! connection task per accepted socket, and support graceful shutdown via
//! a `shutdown_tx: Option<oneshot::Sender<()>>` observed in the accept
//! loop's `tokio::select!`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use wiretap_tls::TlsStore;

use crate::connection;
use crate::hooks::ProxyHooks;

/// Handle to a running proxy server. Dropping it leaves the server
/// running; call [`ProxyServerHandle::shutdown`] and
/// [`ProxyServerHandle::wait_closed`] for a clean stop.
pub struct ProxyServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl ProxyServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections. Connections already in flight run
    /// to completion; this does not cut them off.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the accept loop to actually exit, e.g. after calling
    /// [`ProxyServerHandle::shutdown`].
    pub async fn wait_closed(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

/// Bind `addr` and serve proxy connections until [`ProxyServerHandle::shutdown`]
/// is called. `handler_builder` is invoked once per accepted connection so
/// every connection gets its own [`ProxyHooks`] instance — hooks are `&mut
/// self`, so one instance can't safely be shared across concurrently
/// running connections.
pub async fn start_proxy_server<F>(
    addr: SocketAddr,
    tls_store: Arc<TlsStore>,
    handler_builder: F,
) -> std::io::Result<ProxyServerHandle>
where
    F: Fn() -> Box<dyn ProxyHooks> + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let task_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!(%local_addr, "proxy server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let tls_store = tls_store.clone();
                            let hooks = handler_builder();
                            tokio::spawn(async move {
                                connection::run_connection(stream, peer_addr, tls_store, hooks).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
    });

    Ok(ProxyServerHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        task_handle: Some(task_handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnHandle;
    use crate::connection::write_simple_response;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct EchoStatusHooks;

    #[async_trait]
    impl ProxyHooks for EchoStatusHooks {
        async fn on_request_received(&mut self, conn: &mut dyn ConnHandle) {
            let _ = write_simple_response(conn, 200, "OK", b"hi").await;
        }
    }

    #[tokio::test]
    async fn accepts_connections_and_shuts_down_cleanly() {
        let tls_store = Arc::new(TlsStore::new().unwrap());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut handle = start_proxy_server(addr, tls_store, || Box::new(EchoStatusHooks))
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client
            .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK"));

        handle.shutdown();
        handle.wait_closed().await;
        assert!(TcpStream::connect(handle.local_addr()).await.is_err());
    }
}
