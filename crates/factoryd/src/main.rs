//! factoryd - logical machine factory daemon
//!
//! Runs on each worker host, keeping its slots filled with VM, Docker or
//! Singularity instances, reaping zombies and answering status queries.

use anyhow::{Context, Result};
use factory_lib::{
    backend::{CommandRunner, DriverSet, SystemRunner},
    health::components,
    images::ImageCache,
    protocol::Responder,
    provision::{cgroup::CgroupManager, Provisioner},
    store::StateStore,
    ConfigHandle, ControlCycle, CycleConfig, FactoryMetrics, HealthRegistry, SlotManager,
    StructuredLogger,
};
use factoryd::{api, config::DaemonConfig};
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const FACTORY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting factoryd");

    let config = DaemonConfig::load()?;
    let snapshot = config.snapshot()?;
    info!(
        factory = %snapshot.factory_name,
        space = %snapshot.space,
        num_slots = snapshot.num_slots,
        "Factory configured"
    );

    let store = StateStore::new(&snapshot.base_dir);
    store
        .ensure_layout()
        .context("preparing the factory state directory")?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let cgroups = Arc::new(CgroupManager::detect(&snapshot.cgroup_root).await);
    let drivers = DriverSet::system(&snapshot, runner.clone(), cgroups.clone());
    let provisioner = Arc::new(Provisioner::new(runner, cgroups));
    let images = Arc::new(ImageCache::new(store.imagecache_dir())?);

    let logger = StructuredLogger::new(&snapshot.factory_name);
    logger.log_startup(FACTORY_VERSION, snapshot.num_slots, snapshot.total_processors);

    let query_port = snapshot.query_port;
    let handle = ConfigHandle::new(snapshot);
    let manager = Arc::new(SlotManager::new(
        handle.clone(),
        store,
        drivers,
        provisioner,
        images,
        logger.clone(),
    ));

    // Initialize health registry; a cycle-reported component silent for
    // three cycles is degraded
    let stale_after = 3 * config.cycle_interval().as_secs() as i64;
    let health_registry = HealthRegistry::new();
    for name in components::CYCLE_REPORTED {
        health_registry.register(name).await;
        health_registry.watch(name, stale_after).await;
    }
    health_registry.register(components::RESPONDER).await;

    let metrics = FactoryMetrics::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let cycle = ControlCycle::new(
        manager.clone(),
        health_registry.clone(),
        CycleConfig {
            interval: config.cycle_interval(),
            ..CycleConfig::default()
        },
    );
    let cycle_handle = tokio::spawn(cycle.run(shutdown_tx.subscribe()));

    let responder_handle = match Responder::bind(query_port).await {
        Ok(socket) => {
            let responder = Responder::new(manager.clone());
            let rx = shutdown_tx.subscribe();
            Some(tokio::spawn(async move { responder.serve(socket, rx).await }))
        }
        Err(e) => {
            error!(port = query_port, error = %e, "Failed to bind status port");
            health_registry
                .set_unhealthy(components::RESPONDER, e.to_string())
                .await;
            None
        }
    };

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(
        config.daemon.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    let reason = wait_for_shutdown(&config.path, &handle).await?;
    logger.log_shutdown(reason);
    info!("Shutting down");
    let _ = shutdown_tx.send(());

    if let Err(e) = cycle_handle.await {
        warn!(error = %e, "Control cycle task failed");
    }
    if let Some(handle) = responder_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Responder task failed");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    Ok(())
}

/// Block until SIGINT or SIGTERM, reloading the configuration on SIGHUP
async fn wait_for_shutdown(path: &Path, handle: &ConfigHandle) -> Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                return Ok("SIGINT received");
            }
            _ = terminate.recv() => return Ok("SIGTERM received"),
            _ = hangup.recv() => reload(path, handle).await,
        }
    }
}

async fn reload(path: &Path, handle: &ConfigHandle) {
    let snapshot = DaemonConfig::load_from(path.to_path_buf()).and_then(|c| c.snapshot());
    let current = handle.current().await;
    match snapshot {
        Ok(snapshot)
            if snapshot.factory_name != current.factory_name
                || snapshot.base_dir != current.base_dir
                || snapshot.num_slots != current.num_slots =>
        {
            warn!(path = %path.display(), "Reload rejected, slot layout needs a restart");
        }
        Ok(snapshot) => {
            info!(
                path = %path.display(),
                machinetypes = snapshot.machinetypes.len(),
                "Configuration reloaded"
            );
            handle.replace(snapshot).await;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Reload rejected, keeping current configuration")
        }
    }
}
