use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wiretap_proxy::{start_proxy_server, ForwardingHooks, Timeouts};
use wiretap_tls::TlsStore;

#[derive(Parser)]
#[command(name = "wiretap", about = "Embeddable HTTPS forward proxy with MITM TLS interception", version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Path to the CA private key (PEM). Generated alongside --ca-cert on
    /// first run if either file is missing.
    #[arg(long)]
    ca_key: Option<PathBuf>,

    /// Path to the CA certificate (PEM).
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// DNS resolution timeout, in seconds.
    #[arg(long, default_value = "10")]
    dns_timeout_secs: u64,

    /// Upstream TCP connect timeout, in seconds.
    #[arg(long, default_value = "10")]
    connect_timeout_secs: u64,

    /// Upstream TLS handshake timeout, in seconds.
    #[arg(long, default_value = "10")]
    tls_handshake_timeout_secs: u64,

    /// Idle read timeout while waiting on an upstream response, in seconds.
    #[arg(long, default_value = "60")]
    idle_read_timeout_secs: u64,

    /// Increase log verbosity (-v, -vv). Overridden by RUST_LOG if set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn default_filter(verbose: u8) -> EnvFilter {
    if let Ok(from_env) = std::env::var("RUST_LOG") {
        return EnvFilter::new(from_env);
    }
    let level = match verbose {
        0 => "wiretap=info,wiretap_proxy=info,wiretap_tls=info",
        1 => "wiretap=debug,wiretap_proxy=debug,wiretap_tls=debug",
        _ => "debug",
    };
    EnvFilter::new(level)
}

async fn load_or_generate_ca(
    key_path: Option<PathBuf>,
    cert_path: Option<PathBuf>,
) -> anyhow::Result<TlsStore> {
    let (Some(key_path), Some(cert_path)) = (key_path, cert_path) else {
        tracing::info!("no --ca-key/--ca-cert given, generating a process-local CA");
        return Ok(TlsStore::new()?);
    };

    if key_path.exists() && cert_path.exists() {
        tracing::info!(key = %key_path.display(), cert = %cert_path.display(), "loading CA from disk");
        let key_pem = tokio::fs::read_to_string(&key_path).await?;
        let cert_pem = tokio::fs::read_to_string(&cert_path).await?;
        return Ok(TlsStore::load_ca(&key_pem, &cert_pem)?);
    }

    tracing::info!(key = %key_path.display(), cert = %cert_path.display(), "generating a new CA and saving it");
    let store = TlsStore::new()?;
    if let Some(parent) = key_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    store.save_ca(&key_path, &cert_path).await?;
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(cli.verbose))
        .init();

    let tls_store = Arc::new(load_or_generate_ca(cli.ca_key, cli.ca_cert).await?);

    let timeouts = Timeouts {
        dns: Duration::from_secs(cli.dns_timeout_secs),
        connect: Duration::from_secs(cli.connect_timeout_secs),
        tls_handshake: Duration::from_secs(cli.tls_handshake_timeout_secs),
        idle_read: Duration::from_secs(cli.idle_read_timeout_secs),
    };

    let addr = SocketAddr::new(cli.host, cli.port);
    let transport = Arc::new(
        wiretap_proxy::DirectTransport::new().expect("failed to load native root certificates"),
    );
    let response_hooks = Arc::new(wiretap_proxy::forward::NoopResponseHooks);
    let mut handle = start_proxy_server(addr, tls_store, move || {
        Box::new(ForwardingHooks::with_transport_and_hooks(
            transport.clone(),
            response_hooks.clone(),
            timeouts,
        ))
    })
    .await?;

    tracing::info!(addr = %handle.local_addr(), "wiretap listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c, shutting down");
    handle.shutdown();
    handle.wait_closed().await;

    Ok(())
}
