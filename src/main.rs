use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subdock::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use subdock::config::Config;
use subdock::discovery::Discovery;
use subdock::docker::DockerRuntime;
use subdock::provision::Provisioner;
use subdock::proxy::ProxyServer;
use subdock::registry::Registry;
use subdock::router::Router;
use subdock::runtime::SharedRuntime;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("subdock=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = Config::load_or_default(config_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded (no path given)"),
    }

    print_startup_banner(&config);

    let proxy_addr = config.server.proxy_addr()?;
    let admin_addr = config.server.admin_addr()?;

    let docker = DockerRuntime::connect(config.docker.host.as_deref()).await?;
    let runtime: SharedRuntime = Arc::new(docker);
    let registry = Arc::new(Registry::new());

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn discovery listener
    let discovery = Discovery::new(
        Arc::clone(&runtime),
        Arc::clone(&registry),
        config.docker.discovery_options(),
    );
    let mut discovery_handle = tokio::spawn(discovery.run(shutdown_rx.clone()));

    // Spawn proxy server
    let proxy_server = ProxyServer::with_pool_config(
        proxy_addr,
        Router::new(Arc::clone(&registry)),
        shutdown_rx.clone(),
        config.proxy.pool_config(),
        config.proxy.request_timeout(),
    );
    let mut proxy_handle = tokio::spawn(proxy_server.run());

    // Spawn admin server
    let admin_state = AdminState::new(
        Provisioner::new(Arc::clone(&runtime), config.docker.domain_suffix.clone()),
        Arc::clone(&registry),
        config.server.admin_token.clone(),
    );
    let admin_server = AdminServer::new(admin_addr, admin_state, shutdown_rx.clone());
    let mut admin_handle = tokio::spawn(admin_server.run());

    // Wait for a shutdown signal or for any task to stop on its own
    let stopped = tokio::select! {
        result = shutdown_signal() => {
            result?;
            None
        }
        result = &mut discovery_handle => Some(log_task_exit("Discovery listener", result)),
        result = &mut proxy_handle => Some(log_task_exit("Proxy server", result)),
        result = &mut admin_handle => Some(log_task_exit("Admin server", result)),
    };

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the remaining tasks to stop (with timeout); a finished handle must not be polled again
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if stopped != Some("Discovery listener") {
            let _ = discovery_handle.await;
        }
        if stopped != Some("Proxy server") {
            let _ = proxy_handle.await;
        }
        if stopped != Some("Admin server") {
            let _ = admin_handle.await;
        }
    })
    .await;

    if let Some(task) = stopped {
        error!(task, "Task stopped, exiting");
        std::process::exit(1);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on SIGINT (Ctrl+C), or SIGTERM on unix
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
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

    Ok(())
}

/// Log why a long-running task ended and return its name
fn log_task_exit(
    task: &'static str,
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> &'static str {
    match result {
        Ok(Ok(())) => error!(task, "Task exited unexpectedly"),
        Ok(Err(e)) => error!(task, error = %e, "Task failed"),
        Err(e) => error!(task, error = %e, "Task panicked"),
    }
    task
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
        admin_bind = %config.server.admin_bind,
        admin_port = config.server.admin_port,
        admin_auth = config.server.admin_token.is_some(),
        "Server configuration"
    );
    info!(
        connect_timeout_ms = config.proxy.connect_timeout_ms,
        request_timeout_secs = config.proxy.request_timeout_secs,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        "Forwarding settings"
    );
    info!(
        docker_host = config.docker.host.as_deref().unwrap_or("default"),
        domain_suffix = %config.docker.domain_suffix,
        deregister_on_stop = config.docker.deregister_on_stop,
        "Runtime settings"
    );
}
