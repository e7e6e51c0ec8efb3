use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use wiretap_proxy::egress::{EgressRegistry, Fingerprint, HelperAddr, HelperEgress, NativeEgress};
use wiretap_proxy::proxy::{ProxyConfig, ProxyServer};
use wiretap_storage::FjallFlowStore;

#[derive(Parser)]
#[command(name = "wiretap", about = "Intercepting HTTP/HTTPS flow-capture proxy", version)]
struct Cli {
    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Directory for flow storage
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Directory holding ca.crt / ca.key (generated on first run)
    #[arg(long)]
    trust_dir: Option<PathBuf>,

    /// Client profile for the fingerprinted egress dialer
    #[arg(long)]
    fingerprint: Option<String>,

    /// Unix socket of an out-of-process fingerprinting helper
    #[arg(long)]
    egress_socket: Option<PathBuf>,

    /// Disable raw HTTP capture
    #[arg(long)]
    no_raw_http: bool,

    /// Log each dispatched response
    #[arg(short, long)]
    verbose: bool,
}

fn default_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wiretap")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let base_dir = default_base_dir();
    let data_dir = cli.data_dir.unwrap_or_else(|| base_dir.join("data"));
    let trust_dir = cli.trust_dir.unwrap_or_else(|| base_dir.join("ca"));
    std::fs::create_dir_all(&data_dir)?;

    let store = Arc::new(FjallFlowStore::open(&data_dir)?);

    let egress = Arc::new(EgressRegistry::new());
    let provider: Arc<dyn wiretap_proxy::egress::TlsEgress> = match &cli.egress_socket {
        #[cfg(unix)]
        Some(path) => Arc::new(HelperEgress::new(HelperAddr::Unix(path.clone()))),
        #[cfg(not(unix))]
        Some(_) => anyhow::bail!("--egress-socket requires unix domain sockets"),
        None => Arc::new(NativeEgress::new()),
    };
    egress.install(provider).await?;

    let config = ProxyConfig {
        trust_dir: trust_dir.clone(),
        store_raw_http: !cli.no_raw_http,
        verbose: cli.verbose,
        fingerprint: cli
            .fingerprint
            .as_deref()
            .map(Fingerprint::from_tag)
            .unwrap_or(Fingerprint::DEFAULT),
    };
    let server = Arc::new(ProxyServer::new(config, store, egress)?);

    let listener = ProxyServer::bind(cli.port).await?;
    let addr = listener.local_addr()?;

    eprintln!("wiretap: flows stored in {}", data_dir.display());
    eprintln!("wiretap: trust root in {}", trust_dir.display());

    // Announcement contract for supervisors: the chosen address, then READY.
    println!("Proxy running on {addr}");
    println!("READY");

    server.run(listener, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
