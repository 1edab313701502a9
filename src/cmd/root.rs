//! Main daemon command - wires the managers together and serves tools

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use workbench_daemon::audit::{self, AuditEvent};
use workbench_daemon::config::Configuration;
use workbench_daemon::containers::ContainerManager;
use workbench_daemon::database::Database;
use workbench_daemon::docker::DockerService;
use workbench_daemon::exec::{ExecManager, OutputStreamer};
use workbench_daemon::filesystem::FilesystemManager;
use workbench_daemon::image::ImagePolicy;
use workbench_daemon::maintenance::MaintenanceLoop;
use workbench_daemon::reconcile::ReconciliationEngine;
use workbench_daemon::security::SecurityProfile;
use workbench_daemon::shutdown::ShutdownCoordinator;
use workbench_daemon::tools::{build_router, AppState};
use workbench_daemon::warmpool::WarmPool;

/// Run the daemon until a shutdown signal arrives.
pub async fn run(config: Configuration) -> Result<()> {
    let config = Arc::new(config);

    info!("  Tool surface: {}:{}", config.host, config.port);
    info!("  State database: {}", config.state_db);
    info!("  Allowed registries: {}", config.allowed_registries);

    let docker = match &config.docker_host {
        Some(socket) => DockerService::with_socket(socket),
        None => DockerService::new(),
    }
    .context("failed to create Docker client")?;

    docker
        .ping()
        .await
        .context("Docker engine is not reachable")?;
    info!("Docker engine reachable (version {})", docker.version().await?);

    let db = Arc::new(Database::open(&config.state_db).context("failed to open state database")?);

    let security = SecurityProfile::default();
    let image_policy = Arc::new(ImagePolicy::new(docker.clone(), &config));
    let containers = Arc::new(ContainerManager::new(
        docker.clone(),
        Arc::clone(&db),
        Arc::clone(&image_policy),
        security.clone(),
    ));
    let streamer = Arc::new(OutputStreamer::new());
    let execs = Arc::new(ExecManager::new(
        docker.clone(),
        Arc::clone(&db),
        Arc::clone(&streamer),
        security,
        config.max_concurrent_execs,
        config.exec_timeout_default_s,
    ));
    let files = Arc::new(FilesystemManager::new(docker.clone(), Arc::clone(&db)));
    let reconciler = Arc::new(ReconciliationEngine::new(
        docker.clone(),
        Arc::clone(&db),
        Arc::clone(&execs),
        config.transient_gc_days,
    ));
    let warm_pool = Arc::new(WarmPool::new(
        Arc::clone(&containers),
        config.warm_pool_enabled,
        config.default_image_alias.clone(),
        config.warm_health_check_interval,
    ));
    let shutdown = Arc::new(ShutdownCoordinator::new(
        Arc::clone(&db),
        Arc::clone(&containers),
        Arc::clone(&execs),
        config.drain_grace_s,
    ));

    audit::record(
        AuditEvent::SystemStartup,
        None,
        json!({"version": env!("CARGO_PKG_VERSION")}),
    );

    // Boot-time reconciliation reattaches to whatever the engine still
    // runs and clears drifted state before any request lands.
    let boot_stats = reconciler.reconcile().await;
    info!(
        discovered = boot_stats.discovered,
        adopted = boot_stats.adopted,
        "boot reconciliation finished"
    );

    warm_pool.start().await;

    let maintenance = Arc::new(MaintenanceLoop::new(Arc::clone(&reconciler)));
    maintenance.start();

    let state = AppState {
        config: Arc::clone(&config),
        docker,
        db,
        containers,
        execs,
        files,
        warm_pool: Arc::clone(&warm_pool),
        reconciler,
        shutdown: Arc::clone(&shutdown),
    };
    let app = build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("Serving tools on {}", bind_addr);

    // The server stops accepting connections only after the coordinator
    // has finished draining.
    let server_stop = CancellationToken::new();

    {
        let warm_pool = Arc::clone(&warm_pool);
        let maintenance = Arc::clone(&maintenance);
        let shutdown = Arc::clone(&shutdown);
        let server_stop = server_stop.clone();

        tokio::spawn(async move {
            wait_for_signal().await;
            warn!("shutdown signal received");

            maintenance.stop();
            warm_pool.stop();
            shutdown.shutdown().await;
            server_stop.cancel();
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_stop.cancelled().await })
        .await
        .context("server error")?;

    info!("Daemon stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
