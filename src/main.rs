use homeproxy::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use homeproxy::config::Config;
use homeproxy::cull::CullService;
use homeproxy::directory;
use homeproxy::docker::DockerRuntime;
use homeproxy::error::StartupError;
use homeproxy::forward::ProxyFactory;
use homeproxy::pool::{ConnectionPool, PoolConfig};
use homeproxy::provision::{ProvisionSettings, WorkloadNaming, WorkloadProvisioner};
use homeproxy::proxy::ProxyServer;
use homeproxy::registry::TenantRegistry;
use homeproxy::router::Router;
use homeproxy::runtime::SharedRuntime;
use homeproxy::wait_page::WaitPage;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("homeproxy.toml"));

    let config = Config::load(&config_path);

    // Initialize logging; the debug flag only raises our own crate's level
    let level = match &config {
        Ok(config) if config.server.debug => "homeproxy=debug",
        _ => "homeproxy=info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.parse().expect("valid log directive")),
        )
        .init();

    let config = config.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        StartupError::Config {
            path: config_path.display().to_string(),
            message: format!("{:#}", e),
        }
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    // Print startup banner
    print_startup_banner(&config);

    // Container runtime must be reachable before anything is served
    let docker = DockerRuntime::connect(&config.runtime).await.map_err(|e| {
        error!(error = %e, "Container runtime unavailable");
        StartupError::Runtime(e)
    })?;
    let runtime: SharedRuntime = Arc::new(docker);

    if let Some(network) = config.runtime.network.as_deref() {
        runtime.ensure_network(network).await.map_err(|e| {
            error!(network, error = %e, "Failed to ensure network");
            StartupError::Network {
                network: network.to_string(),
                source: e,
            }
        })?;
        info!(network, "Network ready");
    }

    let resolver = directory::from_config(&config.directory)?;

    let wait_page = Arc::new(match config.server.wait_template.as_deref() {
        Some(path) => WaitPage::from_file(path, config.server.wait_reload_secs)?,
        None => WaitPage::new(config.server.wait_reload_secs),
    });

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let pool = Arc::new(ConnectionPool::new(pool_config));

    let registry = TenantRegistry::new();
    let naming = WorkloadNaming::new(config.runtime.name_prefix.clone());
    let factory = Arc::new(ProxyFactory::new(
        Arc::clone(&pool),
        Arc::clone(&registry),
        Arc::clone(&wait_page),
        config.server.request_timeout(),
    ));
    let provisioner = Arc::new(WorkloadProvisioner::new(
        Arc::clone(&runtime),
        resolver,
        naming.clone(),
        ProvisionSettings::from(&config.runtime),
    ));
    let router = Router::new(Arc::clone(&registry), provisioner, factory, wait_page);

    let culler = Arc::new(CullService::new(
        Arc::clone(&registry),
        Arc::clone(&runtime),
        naming,
        config.cull.idle_timeout(),
        config.runtime.call_timeout(),
    ));

    if config.cull.enabled {
        tokio::spawn(idle_cull_loop(
            Arc::clone(&culler),
            config.cull.interval(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(orphan_cull_loop(
            Arc::clone(&culler),
            config.cull.orphan_interval(),
            shutdown_rx.clone(),
        ));
    } else {
        warn!("Culling disabled, idle workloads will keep running");
    }

    // Create proxy server
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let proxy_server = ProxyServer::new(proxy_addr, router, shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Create admin server (loopback only)
    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let state = AdminState::new(Arc::clone(&registry), Arc::clone(&culler), pool.stats(), admin_token);
        let admin_server = AdminServer::new(admin_addr, state, shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; tenant workloads keep running and are picked up again on restart
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!(tenants = registry.len(), "Shutdown complete");
    Ok(())
}

async fn idle_cull_loop(culler: Arc<CullService>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                culler.run_idle_cull().await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn orphan_cull_loop(culler: Arc<CullService>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = culler.run_orphan_cull().await {
                    warn!(error = %e, "Orphan cull failed, retrying next interval");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting proxy server"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        image = %config.runtime.image,
        network = config.runtime.network.as_deref().unwrap_or("bridge"),
        name_prefix = %config.runtime.name_prefix,
        backend_port = config.runtime.backend_port,
        pull_policy = ?config.runtime.pull_policy,
        "Runtime settings"
    );
    info!(
        enabled = config.cull.enabled,
        interval_secs = config.cull.interval_secs,
        idle_timeout_secs = config.cull.idle_timeout_secs,
        orphan_interval_secs = config.cull.orphan_interval_secs,
        "Cull settings"
    );
    info!(
        backend = ?config.directory.backend,
        public_dir = %config.directory.public_dir,
        extra_mounts = ?config.directory.extra_mounts,
        "Directory settings"
    );
}
