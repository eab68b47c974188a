use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::auth::JwtVerifier;
use crate::config::Config;
use crate::directory::{DeviceDirectory, MemoryDirectory};
use crate::hub::Hub;
use crate::server::{self, AppState};

/// A bound, running signaling server.
pub struct RunningServer {
    pub bound_addr: SocketAddr,
    pub hub: Arc<Hub>,
    stop_http: Arc<Notify>,
    http_task: JoinHandle<Result<()>>,
    hub_task: JoinHandle<()>,
}

impl RunningServer {
    /// Stops accepting requests, stops the hub and closes every live
    /// connection.
    pub async fn stop(self) -> Result<()> {
        self.stop_http.notify_one();
        let served = self.http_task.await.context("join http server")?;
        self.hub.shutdown();
        self.hub.close_all();
        self.hub_task.await.context("join hub")?;
        tracing::info!("signaling server stopped");
        served
    }
}

/// Binds `cfg.listen_addr` and starts the hub and HTTP server on the current
/// runtime, backed by an in-memory directory seeded from `cfg.devices`.
pub async fn start(cfg: &Config) -> Result<RunningServer> {
    let directory = Arc::new(MemoryDirectory::new(cfg.devices.clone()));
    start_with_directory(cfg, directory).await
}

pub async fn start_with_directory(
    cfg: &Config,
    directory: Arc<dyn DeviceDirectory>,
) -> Result<RunningServer> {
    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    let bound_addr = listener.local_addr().context("local addr")?;

    let (hub, runner) = Hub::new(Some(directory.clone()));
    let hub_task = tokio::spawn(runner.run());

    let state = AppState {
        hub: hub.clone(),
        directory,
        verifier: Arc::new(JwtVerifier::new(&cfg.jwt_secret)),
        ice: Arc::new(cfg.ice.clone()),
        settings: cfg.hub.connection_settings(),
    };
    let stop_http = Arc::new(Notify::new());
    let http_task = tokio::spawn(server::serve(
        listener,
        server::router(state),
        stop_http.clone(),
    ));

    tracing::info!(addr = %bound_addr, "signaling server listening");
    Ok(RunningServer {
        bound_addr,
        hub,
        stop_http,
        http_task,
        hub_task,
    })
}

/// Runs the server on the *current* tokio runtime until `shutdown` is notified.
pub async fn run_with_shutdown(cfg: Config, shutdown: Arc<Notify>) -> Result<()> {
    crate::logging::init(cfg.log_path.as_deref())?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cfg
            .config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        devices = cfg.devices.len(),
        "devicelink start"
    );

    let running = start(&cfg).await?;
    shutdown.notified().await;
    tracing::info!("shutdown requested");
    running.stop().await
}
