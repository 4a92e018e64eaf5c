//! Worker processes for the supervisor role.
//!
//! The supervisor starts copies of its own binary with `SLUICE_SERVER_ROLE=worker` and talks
//! to each over line-oriented pipes. The worker prints `ready` on stdout once it listens,
//! then `errors <n>` lines carrying request errors since its previous report. It stops
//! admitting and exits when it reads `drain` on stdin.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sluice_core::admission::AdmissionController;
use sluice_core::health::{ErrorTracker, PoolError, WorkerHandle, WorkerSpawner};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const READY_LINE: &str = "ready";
pub const DRAIN_LINE: &str = "drain";
pub const ERRORS_PREFIX: &str = "errors";

type StdoutLines = Lines<BufReader<ChildStdout>>;

/// Workers listen one port above the supervisor, in slot order.
pub fn worker_port(base_port: u16, slot: usize) -> u16 {
    base_port.saturating_add(1).saturating_add(slot as u16)
}

pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    bind_address: String,
    base_port: u16,
    errors: ErrorTracker,
}

impl ProcessSpawner {
    pub fn new(
        program: impl Into<PathBuf>,
        bind_address: impl Into<String>,
        base_port: u16,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            bind_address: bind_address.into(),
            base_port,
            errors: ErrorTracker::default(),
        }
    }

    /// Error reports from every worker land in `errors`.
    pub fn with_error_tracker(mut self, errors: ErrorTracker) -> Self {
        self.errors = errors;
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn port_for(&self, slot: usize) -> u16 {
        worker_port(self.base_port, slot)
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, slot: usize) -> Result<Box<dyn WorkerHandle>, PoolError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("SLUICE_SERVER_ROLE", "worker")
            .env("SLUICE_SERVER_BIND_ADDRESS", &self.bind_address)
            .env("SLUICE_SERVER_PORT", self.port_for(slot).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| PoolError::Spawn { slot, message: error.to_string() })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| PoolError::Spawn {
            slot,
            message: "worker stdout was not captured".to_string(),
        })?;

        info!(
            event_name = "worker.spawned",
            slot,
            pid = child.id(),
            port = self.port_for(slot),
            "worker spawned"
        );
        Ok(Box::new(ChildWorker {
            slot,
            child,
            stdin,
            stdout: Some(BufReader::new(stdout).lines()),
            errors: self.errors.clone(),
            relay: None,
        }))
    }
}

pub struct ChildWorker {
    slot: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    /// Handed to the report relay once the worker is ready.
    stdout: Option<StdoutLines>,
    errors: ErrorTracker,
    relay: Option<JoinHandle<()>>,
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}

#[async_trait]
impl WorkerHandle for ChildWorker {
    fn slot(&self) -> usize {
        self.slot
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn drain(&mut self) -> Result<(), PoolError> {
        let slot = self.slot;
        let stdin = self.stdin.as_mut().ok_or_else(|| PoolError::Control {
            slot,
            message: "worker stdin is closed".to_string(),
        })?;
        stdin.write_all(format!("{DRAIN_LINE}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn wait_exit(&mut self, timeout: Duration) -> Result<bool, PoolError> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(
                    event_name = "worker.exited",
                    slot = self.slot,
                    status = %status,
                    "worker exited"
                );
                Ok(true)
            }
            Ok(Err(error)) => Err(PoolError::Io(error)),
            Err(_) => Ok(false),
        }
    }

    async fn terminate(&mut self) -> Result<(), PoolError> {
        self.child.kill().await?;
        Ok(())
    }

    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), PoolError> {
        let slot = self.slot;
        let Some(mut lines) = self.stdout.take() else {
            return Err(PoolError::Control {
                slot,
                message: "worker already reported ready".to_string(),
            });
        };
        match tokio::time::timeout(timeout, read_until_ready(&mut lines, slot)).await {
            Ok(Ok(())) => {
                self.relay = Some(spawn_report_relay(lines, slot, self.errors.clone()));
                Ok(())
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(PoolError::ReadyTimeout { slot, timeout_ms: timeout.as_millis() as u64 }),
        }
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

async fn read_until_ready(lines: &mut StdoutLines, slot: usize) -> Result<(), PoolError> {
    while let Some(line) = lines.next_line().await? {
        if line.trim() == READY_LINE {
            return Ok(());
        }
    }
    Err(PoolError::Control { slot, message: "worker exited before reporting ready".to_string() })
}

/// `errors <n>` from a worker; anything else is not a report.
pub fn parse_error_report(line: &str) -> Option<u64> {
    let count = line.trim().strip_prefix(ERRORS_PREFIX)?;
    if !count.starts_with(char::is_whitespace) {
        return None;
    }
    count.trim().parse().ok()
}

/// Supervisor side: feeds a worker's error reports into the shared tracker until its
/// stdout closes.
fn spawn_report_relay(mut lines: StdoutLines, slot: usize, errors: ErrorTracker) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_error_report(&line) {
                    Some(count) => {
                        errors.record_many(count);
                        debug!(event_name = "worker.errors.reported", slot, count, "worker errors");
                    }
                    None => {
                        debug!(
                            event_name = "worker.stdout.ignored",
                            slot,
                            line = %line,
                            "stray line"
                        );
                    }
                },
                Ok(None) => break,
                Err(error) => {
                    warn!(
                        event_name = "worker.stdout.failed",
                        slot,
                        error = %error,
                        "worker stdout could not be read"
                    );
                    break;
                }
            }
        }
    })
}

/// Tells the supervisor this worker is accepting connections.
pub fn announce_ready() -> std::io::Result<()> {
    use std::io::Write;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{READY_LINE}")?;
    stdout.flush()
}

fn write_error_report(count: u64) -> std::io::Result<()> {
    use std::io::Write;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{ERRORS_PREFIX} {count}")?;
    stdout.flush()
}

/// Worker side of error reporting: every `every`, prints the errors recorded since the
/// previous report. A last report goes out when `shutdown` flips.
pub fn spawn_error_reporter(
    errors: ErrorTracker,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reported = errors.total();
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            let stopping = tokio::select! {
                _ = ticker.tick() => false,
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };
            let total = errors.total();
            if total > reported {
                if let Err(error) = write_error_report(total - reported) {
                    warn!(
                        event_name = "worker.errors.report_failed",
                        error = %error,
                        "could not report errors to the supervisor"
                    );
                }
                reported = total;
            }
            if stopping {
                break;
            }
        }
    })
}

/// Worker side of the control pipe: a `drain` line (or a closed stdin, meaning the
/// supervisor is gone) drains admission and signals shutdown.
pub fn spawn_control_listener(
    admission: AdmissionController,
    grace: Duration,
    shutdown: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim() == DRAIN_LINE => {
                    info!(event_name = "worker.drain.requested", "drain requested by supervisor");
                    break;
                }
                Ok(Some(line)) => {
                    warn!(
                        event_name = "worker.control.unknown",
                        line = %line,
                        "unknown control line"
                    );
                }
                Ok(None) => {
                    warn!(event_name = "worker.control.closed", "control pipe closed; draining");
                    break;
                }
                Err(error) => {
                    warn!(
                        event_name = "worker.control.failed",
                        error = %error,
                        "control pipe failed; draining"
                    );
                    break;
                }
            }
        }
        admission.drain(grace).await;
        shutdown.send_replace(true);
    })
}
