mod admin;
mod bootstrap;
mod forward;
mod health;
mod proxy;
#[cfg(test)]
mod testing;
mod upstream;
mod worker;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use sluice_core::config::{AppConfig, LoadOptions, ProcessRole};
use sluice_core::health::WorkerPool;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bootstrap::{Application, Serving};

/// Exit status after a health-triggered drain; the process manager restarts on it.
const RESTART_EXIT_CODE: u8 = 75;
const RESPAWN_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const ERROR_REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopCause {
    Signal,
    Drained,
}

fn init_logging(config: &AppConfig) {
    use sluice_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    // stdout carries the worker control line
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    match config.logging.format {
        Compact => builder.compact().init(),
        Pretty => builder.pretty().init(),
        Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    run().await
}

pub async fn run() -> Result<ExitCode> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    match app.config.server.role {
        ProcessRole::Single => serve_single(app).await,
        ProcessRole::Worker => serve_worker(app).await,
        ProcessRole::Supervisor => supervise(app).await,
    }
}

async fn serve_single(app: Application) -> Result<ExitCode> {
    let serving = app.serving.clone().context("single role requires a gateway")?;
    let health_task = app.supervisor.clone().spawn(app.shutdown.subscribe());
    let maintenance = serving
        .gateway
        .spawn_maintenance(app.config.cache.sweep_interval(), app.shutdown.subscribe());

    let listener = bind(&app).await?;
    let cause = serve(listener, traffic_router(&app, &serving), &app.shutdown).await?;
    let _ = tokio::join!(health_task, maintenance);
    save_snapshot(&serving).await;

    if cause == StopCause::Drained {
        warn!(
            event_name = "system.server.restart_exit",
            correlation_id = "shutdown",
            exit_code = RESTART_EXIT_CODE,
            "drained for restart; exiting"
        );
        return Ok(ExitCode::from(RESTART_EXIT_CODE));
    }
    Ok(ExitCode::SUCCESS)
}

async fn serve_worker(app: Application) -> Result<ExitCode> {
    let serving = app.serving.clone().context("worker role requires a gateway")?;
    let control = worker::spawn_control_listener(
        serving.gateway.admission().clone(),
        app.config.health.graceful_shutdown_timeout(),
        app.shutdown.clone(),
    );
    let maintenance = serving
        .gateway
        .spawn_maintenance(app.config.cache.sweep_interval(), app.shutdown.subscribe());

    let listener = bind(&app).await?;
    worker::announce_ready()?;
    let reporter = worker::spawn_error_reporter(
        serving.gateway.errors().clone(),
        ERROR_REPORT_INTERVAL,
        app.shutdown.subscribe(),
    );
    serve(listener, traffic_router(&app, &serving), &app.shutdown).await?;

    control.abort();
    let _ = tokio::join!(maintenance, reporter);
    save_snapshot(&serving).await;
    Ok(ExitCode::SUCCESS)
}

async fn save_snapshot(serving: &Serving) {
    if let Some(path) = &serving.snapshot_path {
        let written = bootstrap::persist_snapshot(&serving.gateway, path).await;
        info!(
            event_name = "system.shutdown.snapshot_written",
            correlation_id = "shutdown",
            entries = written,
            path = %path.display(),
            "cache snapshot written"
        );
    }
}

async fn supervise(app: Application) -> Result<ExitCode> {
    let pool = app.pool.clone().context("supervisor role requires a worker pool")?;
    pool.start().await?;
    info!(
        event_name = "system.supervisor.workers_started",
        correlation_id = "bootstrap",
        workers = pool.size(),
        "worker pool started"
    );

    let health_task = app.supervisor.clone().spawn(app.shutdown.subscribe());
    let monitor = spawn_respawn_monitor(pool.clone(), app.shutdown.subscribe());

    let backends = forward::PoolBackends::new(
        pool.clone(),
        &app.config.server.bind_address,
        app.config.server.port,
    );
    let forward_timeout = Duration::from_secs(app.config.upstream.timeout_secs)
        + app.config.admission.queue_timeout();
    let front = forward::router(forward::ForwardState::new(Arc::new(backends), forward_timeout)?);

    let listener = bind(&app).await?;
    serve(listener, front.merge(monitoring_router(&app)), &app.shutdown).await?;

    let _ = tokio::join!(health_task, monitor);
    pool.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

fn traffic_router(app: &Application, serving: &Serving) -> Router {
    let state =
        proxy::ProxyState { gateway: serving.gateway.clone(), origin: serving.origin.clone() };
    proxy::router(state).merge(monitoring_router(app))
}

fn monitoring_router(app: &Application) -> Router {
    let gateway = app.serving.as_ref().map(|serving| serving.gateway.clone());
    let health = health::router(health::HealthState {
        role: app.config.server.role,
        supervisor: app.supervisor.clone(),
        gateway: gateway.clone(),
        pool: app.pool.clone(),
    });
    let admin = admin::router(admin::AdminState {
        admin_token: app.config.server.admin_token.clone(),
        supervisor: app.supervisor.clone(),
        gateway,
    });
    health.merge(admin)
}

async fn bind(app: &Application) -> Result<TcpListener> {
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener =
        TcpListener::bind(&address).await.with_context(|| format!("could not bind {address}"))?;
    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        role = ?app.config.server.role,
        bind_address = %address,
        "sluice-server listening"
    );
    Ok(listener)
}

/// Serves until ctrl-c or until something flips `shutdown`, then flips it for everyone else.
async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: &watch::Sender<bool>,
) -> Result<StopCause> {
    let (cause_tx, mut cause_rx) = watch::channel(StopCause::Signal);
    let signal = shutdown.subscribe();

    axum::serve(listener, router.layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(error) = result {
                        warn!(
                            event_name = "system.signal.failed",
                            error = %error,
                            "ctrl-c handler failed"
                        );
                    }
                }
                _ = stop_requested(signal) => {
                    cause_tx.send_replace(StopCause::Drained);
                }
            }
        })
        .await?;

    shutdown.send_replace(true);
    let cause = *cause_rx.borrow_and_update();
    info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        cause = ?cause,
        "sluice-server stopping"
    );
    Ok(cause)
}

async fn stop_requested(mut signal: watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_respawn_monitor(
    pool: Arc<WorkerPool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(RESPAWN_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let respawned = pool.respawn_exited().await;
                    if !respawned.is_empty() {
                        warn!(
                            event_name = "system.supervisor.workers_respawned",
                            slots = ?respawned,
                            "replaced workers that exited on their own"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
