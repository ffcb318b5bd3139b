use moat::admin::VERSION;
use moat::config::Settings;
use moat::docker::DockerRuntime;
use moat::proxy::{Gateway, ProxyServer};
use moat::reconcile::{Reconciler, RuntimeFactory, DEFAULT_STOP_TIMEOUT};
use moat::registry::ServiceRegistry;
use moat::reload::{reload_settings_async, ConfigWatcher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("moat=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("moat.toml"));

    let settings = Settings::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&settings);

    let bind_addr: SocketAddr = format!("{}:{}", settings.server.bind, settings.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", settings.server.bind, e))?;

    let shutdown = CancellationToken::new();
    let registry = ServiceRegistry::new();
    let factory: RuntimeFactory = Arc::new(DockerRuntime::from_config);
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&registry), factory, shutdown.clone()));

    let gateway = Gateway::new(settings, reconciler);
    gateway.start().await;

    let server = ProxyServer::new(Arc::clone(&gateway), shutdown.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(bind_addr).await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Keep the watcher alive for the lifetime of the process
    let (config_watcher, mut config_updates) = ConfigWatcher::new(&config_path);
    let _config_watch = match config_watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Configuration file watching unavailable, use SIGHUP to reload");
            None
        }
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP / file change)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    if let Some(new) = reload_settings_async(config_path.clone()).await {
                        gateway.apply_settings(new).await;
                    }
                }
                Some(new) = config_updates.recv() => {
                    gateway.apply_settings(new).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
                Some(new) = config_updates.recv() => {
                    gateway.apply_settings(new).await;
                }
            }
        }
    }

    // Stop accepting connections, then stop discovery
    shutdown.cancel();
    gateway.shutdown().await;

    // Wait for the listener to stop (with timeout)
    let _ = tokio::time::timeout(DEFAULT_STOP_TIMEOUT, server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(settings: &Settings) {
    info!(version = VERSION, "Starting moat gateway");
    info!(
        bind = %settings.server.bind,
        port = settings.server.port,
        base_url = %settings.server.base_url,
        "Server configuration"
    );
    info!(
        connect_timeout_secs = settings.proxy.connect_timeout_secs,
        read_timeout_secs = settings.proxy.read_timeout_secs,
        buffer_threshold_bytes = settings.proxy.buffer_threshold_bytes,
        pool_max_idle = settings.proxy.pool_max_idle_per_host,
        "Proxy settings"
    );
    info!(
        auth_enabled = settings.auth.enabled,
        discovery_enabled = settings.discovery.enabled,
        label_prefix = %settings.discovery.label_prefix,
        static_services = settings.static_services.len(),
        "Routing configuration"
    );
}
