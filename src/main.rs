//! Boot entry point. Staged startup modeled directly on `vinit::main`'s
//! `BootTracker`-driven boot: each stage is announced with its elapsed time,
//! ending with the bridge's accept loop instead of `vinit`'s `waitpid` reap
//! loop.

use std::sync::Arc;
use std::time::Instant;

use gcs::bridge::Bridge;
use gcs::config::{Config, Transport};
use gcs::oci;
use gcs::registry::Registry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Announces each boot stage with the time elapsed since the previous one,
/// the way `vinit::main`'s `BootTracker` times `set_basic_env`/
/// `setup_overlayfs`/`setup_network`.
struct Timeline {
    last: Instant,
}

impl Timeline {
    fn new() -> Timeline {
        Timeline { last: Instant::now() }
    }

    fn begin(&mut self, stage: &str) {
        let now = Instant::now();
        let diff = now.duration_since(self.last);
        info!("[*] {stage}  (+{}ms)", diff.as_millis());
        self.last = now;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    let mut timeline = Timeline::new();
    timeline.begin("starting gcs");

    let runtime = oci::Runtime::new(config.runtime_binary.clone());
    let registry = Arc::new(Registry::new(runtime));
    registry.set_require_policy(config.require_policy);
    timeline.begin("registry constructed");

    let bridge = Bridge::new(Arc::clone(&registry));
    timeline.begin("bridge handlers registered");

    let transport = config.transport();
    timeline.begin("booted");

    match transport {
        Transport::Unix { path } => serve_unix(&bridge, &path).await,
        Transport::Vsock { port } => serve_vsock(&bridge, port).await,
    }
}

async fn serve_unix(bridge: &Arc<Bridge>, path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let _ = std::fs::remove_file(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = tokio::net::UnixListener::bind(path)?;
    info!(path = %path.display(), "listening on unix socket");

    loop {
        let (stream, _addr) = listener.accept().await?;
        info!("host connected");
        if let Err(e) = bridge.serve(stream).await {
            error!(error = %e, "connection ended with an error");
        } else {
            info!("host disconnected");
        }
    }
}

#[cfg(feature = "vsock")]
async fn serve_vsock(bridge: &Arc<Bridge>, port: u32) -> Result<(), Box<dyn std::error::Error>> {
    let mut listener = tokio_vsock::VsockListener::bind(libc::VMADDR_CID_ANY, port)?;
    info!(port, "listening on vsock");

    loop {
        let (stream, _addr) = listener.accept().await?;
        info!("host connected");
        if let Err(e) = bridge.serve(stream).await {
            error!(error = %e, "connection ended with an error");
        } else {
            info!("host disconnected");
        }
    }
}

#[cfg(not(feature = "vsock"))]
async fn serve_vsock(_bridge: &Arc<Bridge>, _port: u32) -> Result<(), Box<dyn std::error::Error>> {
    Err("built without the `vsock` feature; pass --socket-path instead".into())
}
