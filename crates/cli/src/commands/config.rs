use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use sluice_core::config::{AppConfig, LoadOptions};
use toml::Value;

use crate::commands::CommandResult;

struct Field {
    key: &'static str,
    env_key: Option<&'static str>,
    value: String,
}

fn field(key: &'static str, env_key: Option<&'static str>, value: impl ToString) -> Field {
    Field { key, env_key, value: value.to_string() }
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure("config", "config_validation", error.to_string(), 2)
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source =
            field_source(&field, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", field.key, field.value));
    }

    CommandResult::ok(lines.join("\n"))
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let admin_token = match &config.server.admin_token {
        Some(token) => redact_token(token.expose_secret()),
        None => "<unset>".to_string(),
    };
    let batch_path = config.upstream.batch_path.as_deref().unwrap_or("<unset>");
    let cache_routes = config
        .cache
        .routes
        .iter()
        .map(|route| route.name.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let snapshot_path = match &config.cache.snapshot_path {
        Some(path) => path.display().to_string(),
        None => "<unset>".to_string(),
    };
    let health = &config.health;

    vec![
        field(
            "server.bind_address",
            Some("SLUICE_SERVER_BIND_ADDRESS"),
            &config.server.bind_address,
        ),
        field("server.port", Some("SLUICE_SERVER_PORT"), config.server.port),
        field("server.role", Some("SLUICE_SERVER_ROLE"), format!("{:?}", config.server.role)),
        field("server.workers", Some("SLUICE_SERVER_WORKERS"), config.server.workers),
        field("server.admin_token", Some("SLUICE_ADMIN_TOKEN"), admin_token),
        field("upstream.base_url", Some("SLUICE_UPSTREAM_BASE_URL"), &config.upstream.base_url),
        field(
            "upstream.timeout_secs",
            Some("SLUICE_UPSTREAM_TIMEOUT_SECS"),
            config.upstream.timeout_secs,
        ),
        field("upstream.batch_path", None, batch_path),
        field(
            "admission.max_concurrent_requests",
            Some("SLUICE_MAX_CONCURRENT_REQUESTS"),
            config.admission.max_concurrent_requests,
        ),
        field(
            "admission.max_queue_length",
            Some("SLUICE_MAX_QUEUE_LENGTH"),
            config.admission.max_queue_length,
        ),
        field(
            "admission.queue_timeout_ms",
            Some("SLUICE_QUEUE_TIMEOUT_MS"),
            config.admission.queue_timeout_ms,
        ),
        field(
            "admission.max_response_size_bytes",
            Some("SLUICE_MAX_RESPONSE_SIZE_BYTES"),
            config.admission.max_response_size_bytes,
        ),
        field("cache.max_entries", Some("SLUICE_CACHE_MAX_ENTRIES"), config.cache.max_entries),
        field(
            "cache.max_memory_mb",
            Some("SLUICE_CACHE_MAX_MEMORY_MB"),
            config.cache.max_memory_mb,
        ),
        field(
            "cache.default_ttl_ms",
            Some("SLUICE_CACHE_DEFAULT_TTL_MS"),
            config.cache.default_ttl_ms,
        ),
        field("cache.snapshot_path", Some("SLUICE_CACHE_SNAPSHOT_PATH"), snapshot_path),
        field(
            "cache.routes",
            None,
            if cache_routes.is_empty() { "<none>" } else { cache_routes.as_str() },
        ),
        field("dedup.dedup_ttl_ms", Some("SLUICE_DEDUP_TTL_MS"), config.dedup.dedup_ttl_ms),
        field("dedup.batch_size", Some("SLUICE_BATCH_SIZE"), config.dedup.batch_size),
        field(
            "dedup.batch_timeout_ms",
            Some("SLUICE_BATCH_TIMEOUT_MS"),
            config.dedup.batch_timeout_ms,
        ),
        field(
            "dedup.max_batch_wait_ms",
            Some("SLUICE_MAX_BATCH_WAIT_MS"),
            config.dedup.max_batch_wait_ms,
        ),
        field("health.enabled", Some("SLUICE_HEALTH_ENABLED"), health.enabled),
        field(
            "health.memory_threshold_bytes",
            Some("SLUICE_MEMORY_THRESHOLD_BYTES"),
            health.memory_threshold_bytes,
        ),
        field(
            "health.cpu_threshold_percent",
            Some("SLUICE_CPU_THRESHOLD_PERCENT"),
            health.cpu_threshold_percent,
        ),
        field(
            "health.error_threshold_per_minute",
            Some("SLUICE_ERROR_THRESHOLD_PER_MINUTE"),
            health.error_threshold_per_minute,
        ),
        field(
            "health.health_check_interval_ms",
            Some("SLUICE_HEALTH_CHECK_INTERVAL_MS"),
            health.health_check_interval_ms,
        ),
        field(
            "health.restart_cooldown_ms",
            Some("SLUICE_RESTART_COOLDOWN_MS"),
            health.restart_cooldown_ms,
        ),
        field("health.max_restarts", Some("SLUICE_MAX_RESTARTS"), health.max_restarts),
        field(
            "health.graceful_shutdown_timeout_ms",
            Some("SLUICE_GRACEFUL_SHUTDOWN_TIMEOUT_MS"),
            health.graceful_shutdown_timeout_ms,
        ),
        field("logging.level", Some("SLUICE_LOGGING_LEVEL"), &config.logging.level),
        field(
            "logging.format",
            Some("SLUICE_LOGGING_FORMAT"),
            format!("{:?}", config.logging.format),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("sluice.toml"), PathBuf::from("config/sluice.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    field: &Field,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = field.env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, field.key) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact_token(token: &str) -> String {
    if token.trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, redact_token};

    #[test]
    fn nested_keys_are_found_in_the_file_document() {
        let doc: Value = "[health]\nmax_restarts = 2\n".parse().expect("toml");

        assert!(contains_path(&doc, "health.max_restarts"));
        assert!(!contains_path(&doc, "health.enabled"));
        assert!(!contains_path(&doc, "cache.max_entries"));
    }

    #[test]
    fn tokens_never_leak_into_output() {
        assert_eq!(redact_token("s3cret-value"), "<redacted>");
        assert_eq!(redact_token("  "), "<empty>");
    }
}
