use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use sluice_core::admission::Ticket;
use sluice_core::config::{AppConfig, LoadOptions};
use sluice_core::dedup::RequestDescriptor;
use sluice_core::errors::OriginError;
use sluice_core::gateway::{Gateway, GatewayResponse, OriginFetcher, OriginResponse};

use crate::commands::{render_json, CommandResult};

const SCENARIO_CONCURRENCY: usize = 2;
const ORIGIN_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

/// Stands in for the upstream: counts calls and records how many requests held a slot
/// while it was working.
struct ScenarioOrigin {
    gateway: Gateway,
    calls: AtomicUsize,
    peak_active: AtomicUsize,
}

#[async_trait]
impl OriginFetcher for ScenarioOrigin {
    async fn fetch(&self, request: RequestDescriptor) -> Result<OriginResponse, OriginError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(ORIGIN_DELAY).await;
        let active = self.gateway.admission().stats().active_requests;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        Ok(OriginResponse::json(200, format!("{{\"path\":\"{}\",\"call\":{call}}}", request.path)))
    }
}

type ScenarioOutcome = [Result<GatewayResponse, String>; 3];

pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let config = match timed_check(|| AppConfig::load(LoadOptions::default())) {
        Ok((elapsed_ms, config)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Pass,
                elapsed_ms,
                message: "configuration loaded and validated".to_string(),
            });
            config
        }
        Err((elapsed_ms, error)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Fail,
                elapsed_ms,
                message: error.to_string(),
            });
            checks.push(skipped("identical_requests"));
            checks.push(skipped("single_origin_call"));
            checks.push(skipped("concurrency_ceiling"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            checks.push(SmokeCheck {
                name: "identical_requests",
                status: SmokeStatus::Fail,
                elapsed_ms: 0,
                message: format!("failed to initialize async runtime: {error}"),
            });
            checks.push(skipped("single_origin_call"));
            checks.push(skipped("concurrency_ceiling"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let mut scenario_config = config;
    scenario_config.admission.max_concurrent_requests = SCENARIO_CONCURRENCY;
    let gateway = Gateway::new(&scenario_config);
    let origin = Arc::new(ScenarioOrigin {
        gateway: gateway.clone(),
        calls: AtomicUsize::new(0),
        peak_active: AtomicUsize::new(0),
    });

    let scenario_started = Instant::now();
    let outcome = runtime.block_on(three_identical_requests(&gateway, origin.clone()));
    let scenario_ms = scenario_started.elapsed().as_millis() as u64;

    checks.push(identical_requests_check(&outcome, scenario_ms));

    let calls = origin.calls.load(Ordering::SeqCst);
    checks.push(SmokeCheck {
        name: "single_origin_call",
        status: if calls == 1 { SmokeStatus::Pass } else { SmokeStatus::Fail },
        elapsed_ms: scenario_ms,
        message: format!("origin called {calls} time(s) for 3 identical requests"),
    });

    let peak = origin.peak_active.load(Ordering::SeqCst);
    checks.push(SmokeCheck {
        name: "concurrency_ceiling",
        status: if peak <= SCENARIO_CONCURRENCY { SmokeStatus::Pass } else { SmokeStatus::Fail },
        elapsed_ms: scenario_ms,
        message: format!("peak active requests {peak} with limit {SCENARIO_CONCURRENCY}"),
    });

    finalize_report(checks, started.elapsed().as_millis() as u64)
}

async fn three_identical_requests(
    gateway: &Gateway,
    origin: Arc<ScenarioOrigin>,
) -> ScenarioOutcome {
    let request = RequestDescriptor::new("GET", "/api/smoke/resource").with_query("id", "1");
    let origin: Arc<dyn OriginFetcher> = origin;

    let (first, second, third) = tokio::join!(
        gateway.handle(Ticket::new("smoke-1", "smoke"), request.clone(), origin.clone()),
        gateway.handle(Ticket::new("smoke-2", "smoke"), request.clone(), origin.clone()),
        gateway.handle(Ticket::new("smoke-3", "smoke"), request, origin),
    );
    [first, second, third].map(|result| result.map_err(|error| error.to_string()))
}

fn identical_requests_check(outcome: &ScenarioOutcome, elapsed_ms: u64) -> SmokeCheck {
    let mut bodies = Vec::new();
    let mut sources = Vec::new();
    for result in outcome {
        match result {
            Ok(response) => {
                bodies.push(&response.response.body);
                sources.push(response.source.as_str());
            }
            Err(error) => {
                return SmokeCheck {
                    name: "identical_requests",
                    status: SmokeStatus::Fail,
                    elapsed_ms,
                    message: format!("request failed: {error}"),
                };
            }
        }
    }

    let identical = bodies.windows(2).all(|pair| pair[0] == pair[1]);
    SmokeCheck {
        name: "identical_requests",
        status: if identical { SmokeStatus::Pass } else { SmokeStatus::Fail },
        elapsed_ms,
        message: format!("sources {}; identical bodies: {identical}", sources.join(",")),
    }
}

fn timed_check<T, E>(check: impl FnOnce() -> Result<T, E>) -> Result<(u64, T), (u64, E)> {
    let started = Instant::now();
    match check() {
        Ok(value) => Ok((started.elapsed().as_millis() as u64, value)),
        Err(error) => Err((started.elapsed().as_millis() as u64, error)),
    }
}

fn skipped(name: &'static str) -> SmokeCheck {
    SmokeCheck {
        name,
        status: SmokeStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due to previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = render_json(&report, "smoke", false);
    CommandResult { exit_code: if failed { 6 } else { 0 }, output: format!("{human}\n{machine}") }
}
