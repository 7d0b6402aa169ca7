use portgate::admin::{AdminServer, PKG_NAME, VERSION};
use portgate::allocator::PortAllocator;
use portgate::config::Config;
use portgate::coordinator::LifecycleCoordinator;
use portgate::db::Database;
use portgate::reconciler::ProxyReconciler;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("portgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Open durable state
    let db = Arc::new(Database::open(&config.database.path)?);

    // Wire up the subsystem
    let allocator = PortAllocator::new(
        config.ranges.public.to_range("public"),
        config.ranges.canvas.to_range("canvas"),
    );

    let mut reconciler = ProxyReconciler::new(&config.proxy.config_path, &config.proxy.reload_cmd)
        .with_reload_timeout(config.proxy.reload_timeout());
    if let Some(check_cmd) = &config.proxy.check_cmd {
        reconciler = reconciler.with_check_cmd(check_cmd);
    }

    let coordinator = Arc::new(LifecycleCoordinator::new(allocator, reconciler, db));

    // Converge the proxy to durable truth before accepting requests
    let restored = coordinator.restore().await.map_err(|e| {
        error!(error = %e, "Failed to restore state");
        anyhow::anyhow!("State restore failed: {}", e)
    })?;
    info!(restored, "Restored assignments from database");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid admin bind address: {}", e))?;

    let admin_server = AdminServer::new(
        admin_addr,
        Arc::clone(&coordinator),
        shutdown_rx,
        admin_token,
    );
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    let _ = admin_handle.await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting portgate");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        "Admin API configuration"
    );
    info!(
        public_start = config.ranges.public.start,
        public_end = config.ranges.public.end,
        canvas_start = config.ranges.canvas.start,
        canvas_end = config.ranges.canvas.end,
        "Port ranges"
    );
    info!(
        config_path = %config.proxy.config_path,
        reload_cmd = %config.proxy.reload_cmd,
        check_cmd = ?config.proxy.check_cmd,
        reload_timeout_secs = config.proxy.reload_timeout_secs,
        "Proxy integration"
    );
    info!(path = %config.database.path, "Database");
}
