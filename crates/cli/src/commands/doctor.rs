use serde::Serialize;
use sluice_core::config::{AppConfig, LoadOptions, ProcessRole};
use sluice_core::health::{ProcessSampler, VitalsSampler};
use sysinfo::System;

use crate::commands::render_json;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 3] = ["memory_headroom", "process_vitals", "upstream_target"];

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return render_json(&report, "doctor", true);
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_memory_headroom(&config, host_memory_bytes()));
            checks.push(check_process_vitals(&config, &mut ProcessSampler::current()));
            checks.push(check_upstream_target(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.extend(DEPENDENT_CHECKS.into_iter().map(|name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn host_memory_bytes() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}

/// The memory threshold only means something if the host could actually reach it.
fn check_memory_headroom(config: &AppConfig, total_memory: u64) -> DoctorCheck {
    let threshold = config.health.memory_threshold_bytes;
    if total_memory == 0 {
        return DoctorCheck {
            name: "memory_headroom",
            status: CheckStatus::Skipped,
            details: "host memory size unavailable".to_string(),
        };
    }

    let multiplier = match config.server.role {
        ProcessRole::Supervisor => config.server.workers.max(1) as u64,
        ProcessRole::Single | ProcessRole::Worker => 1,
    };
    let needed = threshold.saturating_mul(multiplier);
    if needed > total_memory {
        return DoctorCheck {
            name: "memory_headroom",
            status: CheckStatus::Fail,
            details: format!(
                "memory threshold {threshold} bytes x {multiplier} process(es) exceeds host \
                 memory of {total_memory} bytes; memory restarts would never trigger"
            ),
        };
    }

    DoctorCheck {
        name: "memory_headroom",
        status: CheckStatus::Pass,
        details: format!("threshold {threshold} bytes fits within {total_memory} bytes"),
    }
}

fn check_process_vitals(config: &AppConfig, sampler: &mut dyn VitalsSampler) -> DoctorCheck {
    let Some(vitals) = sampler.sample() else {
        return DoctorCheck {
            name: "process_vitals",
            status: CheckStatus::Fail,
            details: "process vitals could not be read on this host".to_string(),
        };
    };

    let details = format!(
        "rss {} bytes (threshold {}), cpu {:.1}% (threshold {:.1}%)",
        vitals.rss_bytes,
        config.health.memory_threshold_bytes,
        vitals.cpu_percent,
        config.health.cpu_threshold_percent
    );
    let over = vitals.rss_bytes > config.health.memory_threshold_bytes;
    DoctorCheck {
        name: "process_vitals",
        status: if over { CheckStatus::Fail } else { CheckStatus::Pass },
        details,
    }
}

fn check_upstream_target(config: &AppConfig) -> DoctorCheck {
    let batching = match &config.upstream.batch_path {
        Some(path) => format!("batch endpoint `{path}`"),
        None => "no batch endpoint".to_string(),
    };
    DoctorCheck {
        name: "upstream_target",
        status: CheckStatus::Pass,
        details: format!(
            "forwarding /api/* to `{}` (timeout {}s, {batching})",
            config.upstream.base_url, config.upstream.timeout_secs
        ),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use sluice_core::config::{AppConfig, ProcessRole};
    use sluice_core::health::{ProcessVitals, VitalsSampler};

    use super::{check_memory_headroom, check_process_vitals, CheckStatus};

    struct Fixed(Option<ProcessVitals>);

    impl VitalsSampler for Fixed {
        fn sample(&mut self) -> Option<ProcessVitals> {
            self.0
        }
    }

    #[test]
    fn supervisor_threshold_is_multiplied_by_worker_count() {
        let mut config = AppConfig::default();
        config.health.memory_threshold_bytes = 1_000;
        config.server.role = ProcessRole::Supervisor;
        config.server.workers = 4;

        assert_eq!(check_memory_headroom(&config, 3_999).status, CheckStatus::Fail);
        assert_eq!(check_memory_headroom(&config, 4_000).status, CheckStatus::Pass);
        assert_eq!(check_memory_headroom(&config, 0).status, CheckStatus::Skipped);
    }

    #[test]
    fn vitals_above_threshold_fail_the_check() {
        let mut config = AppConfig::default();
        config.health.memory_threshold_bytes = 100;
        let vitals = ProcessVitals { rss_bytes: 101, heap_used_bytes: 0, cpu_percent: 0.0 };

        let check = check_process_vitals(&config, &mut Fixed(Some(vitals)));
        assert_eq!(check.status, CheckStatus::Fail);
        assert!(check.details.contains("rss 101 bytes"));

        let missing = check_process_vitals(&config, &mut Fixed(None));
        assert_eq!(missing.status, CheckStatus::Fail);
    }
}
