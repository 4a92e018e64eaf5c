use std::path::{Path, PathBuf};
use std::sync::Arc;

use sluice_core::cache::FileKeyValueStore;
use sluice_core::config::{AppConfig, ConfigError, LoadOptions, ProcessRole};
use sluice_core::gateway::{Gateway, OriginFetcher};
use sluice_core::health::{
    DrainingRestart, ErrorTracker, HealthSupervisor, PoolRestart, ProcessSampler, WorkerPool,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::upstream::HttpOrigin;
use crate::worker::ProcessSpawner;

pub struct Application {
    pub config: AppConfig,
    pub supervisor: Arc<HealthSupervisor>,
    pub shutdown: watch::Sender<bool>,
    pub serving: Option<Serving>,
    pub pool: Option<Arc<WorkerPool>>,
}

const SNAPSHOT_PREFIX: &str = "sluice:cache:";

/// Request-path components, present in roles that proxy traffic.
#[derive(Clone)]
pub struct Serving {
    pub gateway: Gateway,
    pub origin: Arc<dyn OriginFetcher>,
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("upstream client could not be built: {0}")]
    Upstream(#[source] reqwest::Error),
    #[error("could not locate the server executable: {0}")]
    Executable(#[source] std::io::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        role = ?config.server.role,
        "starting application bootstrap"
    );
    let (shutdown, _) = watch::channel(false);

    let application = match config.server.role {
        ProcessRole::Single | ProcessRole::Worker => {
            serving_application(config, shutdown).await?
        }
        ProcessRole::Supervisor => {
            let program = std::env::current_exe().map_err(BootstrapError::Executable)?;
            let spawner = ProcessSpawner::new(
                program,
                config.server.bind_address.clone(),
                config.server.port,
            );
            supervisor_application(config, spawner, shutdown)
        }
    };

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        role = ?application.config.server.role,
        "application bootstrap complete"
    );
    Ok(application)
}

async fn serving_application(
    config: AppConfig,
    shutdown: watch::Sender<bool>,
) -> Result<Application, BootstrapError> {
    let gateway = Gateway::new(&config);
    let snapshot_path = config.cache.snapshot_path_for(config.server.role, config.server.port);
    if let Some(path) = &snapshot_path {
        restore_snapshot(&gateway, path).await;
    }
    let origin: Arc<dyn OriginFetcher> =
        Arc::new(HttpOrigin::new(&config.upstream).map_err(BootstrapError::Upstream)?);
    info!(
        event_name = "system.bootstrap.upstream_configured",
        correlation_id = "bootstrap",
        base_url = %config.upstream.base_url,
        batching = origin.supports_batch(),
        "upstream origin configured"
    );

    let executor = DrainingRestart::new(
        gateway.admission().clone(),
        config.health.graceful_shutdown_timeout(),
        shutdown.clone(),
    );
    let sampler = Box::new(ProcessSampler::current());
    let supervisor = HealthSupervisor::new(&config.health, sampler, Arc::new(executor))
        .with_error_tracker(gateway.errors().clone())
        .with_probe(Arc::new(gateway.clone()));

    Ok(Application {
        config,
        supervisor: Arc::new(supervisor),
        shutdown,
        serving: Some(Serving { gateway, origin, snapshot_path }),
        pool: None,
    })
}

/// Warms the cache from a snapshot. A missing file is a cold start; an unreadable one is
/// logged and ignored.
pub async fn restore_snapshot(gateway: &Gateway, path: &Path) -> usize {
    let restored = match FileKeyValueStore::open(path).await {
        Ok(store) => gateway.cache().restore(&store, SNAPSHOT_PREFIX).await,
        Err(error) => Err(error),
    };
    match restored {
        Ok(report) => report.restored,
        Err(error) => {
            warn!(
                event_name = "system.bootstrap.snapshot_unreadable",
                correlation_id = "bootstrap",
                path = %path.display(),
                error = %error,
                "cache snapshot could not be restored; starting cold"
            );
            0
        }
    }
}

/// Writes the live cache to `path`, replacing any earlier snapshot.
pub async fn persist_snapshot(gateway: &Gateway, path: &Path) -> usize {
    let store = FileKeyValueStore::empty(path);
    match gateway.cache().persist(&store, SNAPSHOT_PREFIX).await {
        Ok(written) => written,
        Err(error) => {
            warn!(
                event_name = "system.shutdown.snapshot_failed",
                correlation_id = "shutdown",
                path = %path.display(),
                error = %error,
                "cache snapshot could not be written"
            );
            0
        }
    }
}

fn supervisor_application(
    config: AppConfig,
    spawner: ProcessSpawner,
    shutdown: watch::Sender<bool>,
) -> Application {
    let errors = ErrorTracker::default();
    let spawner = spawner.with_error_tracker(errors.clone());
    let grace = config.health.graceful_shutdown_timeout();
    let pool = Arc::new(WorkerPool::new(Arc::new(spawner), config.server.workers, grace, grace));

    let tracked = pool.clone();
    let sampler = ProcessSampler::tracking(Arc::new(move || tracked.pids()));
    let supervisor = HealthSupervisor::new(
        &config.health,
        Box::new(sampler),
        Arc::new(PoolRestart::new(pool.clone())),
    )
    .with_error_tracker(errors);

    Application {
        config,
        supervisor: Arc::new(supervisor),
        shutdown,
        serving: None,
        pool: Some(pool),
    }
}
