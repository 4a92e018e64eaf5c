use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub admission: AdmissionConfig,
    pub cache: CacheConfig,
    pub dedup: DedupConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub role: ProcessRole,
    pub workers: usize,
    pub admin_token: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub batch_path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub max_concurrent_requests: usize,
    pub max_queue_length: usize,
    pub queue_timeout_ms: u64,
    pub max_response_size_bytes: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_memory_mb: u64,
    pub default_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    pub routes: Vec<CacheRouteConfig>,
    /// Where the cache is written on shutdown and read back on start. Unset disables it.
    pub snapshot_path: Option<PathBuf>,
}

/// One selective caching rule: requests whose method and path prefix match are cached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRouteConfig {
    pub name: String,
    pub path_prefix: String,
    #[serde(default = "default_route_methods")]
    pub methods: Vec<String>,
    pub ttl_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DedupConfig {
    pub dedup_ttl_ms: u64,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub max_batch_wait_ms: u64,
    pub batch_routes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    pub enabled: bool,
    pub memory_threshold_bytes: u64,
    pub cpu_threshold_percent: f32,
    pub error_threshold_per_minute: u32,
    pub health_check_interval_ms: u64,
    pub restart_cooldown_ms: u64,
    pub max_restarts: u32,
    pub graceful_shutdown_timeout_ms: u64,
    pub memory_breach_samples: usize,
    pub cpu_breach_samples: usize,
    pub sample_window: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Single,
    Supervisor,
    Worker,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub role: Option<ProcessRole>,
    pub admin_token: Option<String>,
    pub upstream_base_url: Option<String>,
    pub max_concurrent_requests: Option<usize>,
    pub queue_timeout_ms: Option<u64>,
    pub health_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                role: ProcessRole::Single,
                workers: 2,
                admin_token: None,
            },
            upstream: UpstreamConfig {
                base_url: "http://127.0.0.1:9000".to_string(),
                timeout_secs: 30,
                batch_path: None,
            },
            admission: AdmissionConfig {
                max_concurrent_requests: 10,
                max_queue_length: 100,
                queue_timeout_ms: 30_000,
                max_response_size_bytes: 10 * 1024 * 1024,
            },
            cache: CacheConfig {
                max_entries: 1_000,
                max_memory_mb: 50,
                default_ttl_ms: 300_000,
                sweep_interval_ms: 60_000,
                routes: Vec::new(),
                snapshot_path: None,
            },
            dedup: DedupConfig {
                dedup_ttl_ms: 10_000,
                batch_size: 10,
                batch_timeout_ms: 50,
                max_batch_wait_ms: 2_000,
                batch_routes: Vec::new(),
            },
            health: HealthConfig {
                enabled: true,
                memory_threshold_bytes: 512 * 1024 * 1024,
                cpu_threshold_percent: 80.0,
                error_threshold_per_minute: 50,
                health_check_interval_ms: 30_000,
                restart_cooldown_ms: 300_000,
                max_restarts: 5,
                graceful_shutdown_timeout_ms: 30_000,
                memory_breach_samples: 3,
                cpu_breach_samples: 5,
                sample_window: 10,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl AdmissionConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

impl CacheConfig {
    pub fn max_memory_bytes(&self) -> usize {
        usize::try_from(self.max_memory_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Snapshot file for this process. Workers share one configured path, so each gets
    /// its own file keyed by the port it listens on.
    pub fn snapshot_path_for(&self, role: ProcessRole, port: u16) -> Option<PathBuf> {
        let path = self.snapshot_path.as_ref()?;
        if role != ProcessRole::Worker {
            return Some(path.clone());
        }
        let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("cache");
        let name = match path.extension().and_then(|extension| extension.to_str()) {
            Some(extension) => format!("{stem}.{port}.{extension}"),
            None => format!("{stem}.{port}"),
        };
        Some(path.with_file_name(name))
    }
}

impl DedupConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }
}

fn default_route_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for ProcessRole {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "supervisor" => Ok(Self::Supervisor),
            "worker" => Ok(Self::Worker),
            other => Err(ConfigError::Validation(format!(
                "unsupported process role `{other}` (expected single|supervisor|worker)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("sluice.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(role) = server.role {
                self.server.role = role;
            }
            if let Some(workers) = server.workers {
                self.server.workers = workers;
            }
            if let Some(admin_token_value) = server.admin_token {
                self.server.admin_token = Some(secret_value(admin_token_value));
            }
        }

        if let Some(upstream) = patch.upstream {
            if let Some(base_url) = upstream.base_url {
                self.upstream.base_url = base_url;
            }
            if let Some(timeout_secs) = upstream.timeout_secs {
                self.upstream.timeout_secs = timeout_secs;
            }
            if let Some(batch_path) = upstream.batch_path {
                self.upstream.batch_path = Some(batch_path);
            }
        }

        if let Some(admission) = patch.admission {
            if let Some(max_concurrent_requests) = admission.max_concurrent_requests {
                self.admission.max_concurrent_requests = max_concurrent_requests;
            }
            if let Some(max_queue_length) = admission.max_queue_length {
                self.admission.max_queue_length = max_queue_length;
            }
            if let Some(queue_timeout_ms) = admission.queue_timeout_ms {
                self.admission.queue_timeout_ms = queue_timeout_ms;
            }
            if let Some(max_response_size_bytes) = admission.max_response_size_bytes {
                self.admission.max_response_size_bytes = max_response_size_bytes;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(max_entries) = cache.max_entries {
                self.cache.max_entries = max_entries;
            }
            if let Some(max_memory_mb) = cache.max_memory_mb {
                self.cache.max_memory_mb = max_memory_mb;
            }
            if let Some(default_ttl_ms) = cache.default_ttl_ms {
                self.cache.default_ttl_ms = default_ttl_ms;
            }
            if let Some(sweep_interval_ms) = cache.sweep_interval_ms {
                self.cache.sweep_interval_ms = sweep_interval_ms;
            }
            if let Some(routes) = cache.routes {
                self.cache.routes = routes;
            }
            if let Some(snapshot_path) = cache.snapshot_path {
                self.cache.snapshot_path = Some(snapshot_path);
            }
        }

        if let Some(dedup) = patch.dedup {
            if let Some(dedup_ttl_ms) = dedup.dedup_ttl_ms {
                self.dedup.dedup_ttl_ms = dedup_ttl_ms;
            }
            if let Some(batch_size) = dedup.batch_size {
                self.dedup.batch_size = batch_size;
            }
            if let Some(batch_timeout_ms) = dedup.batch_timeout_ms {
                self.dedup.batch_timeout_ms = batch_timeout_ms;
            }
            if let Some(max_batch_wait_ms) = dedup.max_batch_wait_ms {
                self.dedup.max_batch_wait_ms = max_batch_wait_ms;
            }
            if let Some(batch_routes) = dedup.batch_routes {
                self.dedup.batch_routes = batch_routes;
            }
        }

        if let Some(health) = patch.health {
            if let Some(enabled) = health.enabled {
                self.health.enabled = enabled;
            }
            if let Some(memory_threshold_bytes) = health.memory_threshold_bytes {
                self.health.memory_threshold_bytes = memory_threshold_bytes;
            }
            if let Some(cpu_threshold_percent) = health.cpu_threshold_percent {
                self.health.cpu_threshold_percent = cpu_threshold_percent;
            }
            if let Some(error_threshold_per_minute) = health.error_threshold_per_minute {
                self.health.error_threshold_per_minute = error_threshold_per_minute;
            }
            if let Some(health_check_interval_ms) = health.health_check_interval_ms {
                self.health.health_check_interval_ms = health_check_interval_ms;
            }
            if let Some(restart_cooldown_ms) = health.restart_cooldown_ms {
                self.health.restart_cooldown_ms = restart_cooldown_ms;
            }
            if let Some(max_restarts) = health.max_restarts {
                self.health.max_restarts = max_restarts;
            }
            if let Some(graceful_shutdown_timeout_ms) = health.graceful_shutdown_timeout_ms {
                self.health.graceful_shutdown_timeout_ms = graceful_shutdown_timeout_ms;
            }
            if let Some(memory_breach_samples) = health.memory_breach_samples {
                self.health.memory_breach_samples = memory_breach_samples;
            }
            if let Some(cpu_breach_samples) = health.cpu_breach_samples {
                self.health.cpu_breach_samples = cpu_breach_samples;
            }
            if let Some(sample_window) = health.sample_window {
                self.health.sample_window = sample_window;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SLUICE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("SLUICE_SERVER_PORT") {
            self.server.port = parse_num("SLUICE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("SLUICE_SERVER_ROLE") {
            self.server.role = value.parse()?;
        }
        if let Some(value) = read_env("SLUICE_SERVER_WORKERS") {
            self.server.workers = parse_num("SLUICE_SERVER_WORKERS", &value)?;
        }
        if let Some(value) = read_env("SLUICE_ADMIN_TOKEN") {
            self.server.admin_token = Some(secret_value(value));
        }

        if let Some(value) = read_env("SLUICE_UPSTREAM_BASE_URL") {
            self.upstream.base_url = value;
        }
        if let Some(value) = read_env("SLUICE_UPSTREAM_TIMEOUT_SECS") {
            self.upstream.timeout_secs = parse_num("SLUICE_UPSTREAM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("SLUICE_MAX_CONCURRENT_REQUESTS") {
            self.admission.max_concurrent_requests =
                parse_num("SLUICE_MAX_CONCURRENT_REQUESTS", &value)?;
        }
        if let Some(value) = read_env("SLUICE_MAX_QUEUE_LENGTH") {
            self.admission.max_queue_length = parse_num("SLUICE_MAX_QUEUE_LENGTH", &value)?;
        }
        if let Some(value) = read_env("SLUICE_QUEUE_TIMEOUT_MS") {
            self.admission.queue_timeout_ms = parse_num("SLUICE_QUEUE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("SLUICE_MAX_RESPONSE_SIZE_BYTES") {
            self.admission.max_response_size_bytes =
                parse_num("SLUICE_MAX_RESPONSE_SIZE_BYTES", &value)?;
        }

        if let Some(value) = read_env("SLUICE_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = parse_num("SLUICE_CACHE_MAX_ENTRIES", &value)?;
        }
        if let Some(value) = read_env("SLUICE_CACHE_MAX_MEMORY_MB") {
            self.cache.max_memory_mb = parse_num("SLUICE_CACHE_MAX_MEMORY_MB", &value)?;
        }
        if let Some(value) = read_env("SLUICE_CACHE_DEFAULT_TTL_MS") {
            self.cache.default_ttl_ms = parse_num("SLUICE_CACHE_DEFAULT_TTL_MS", &value)?;
        }
        if let Some(value) = read_env("SLUICE_CACHE_SNAPSHOT_PATH") {
            self.cache.snapshot_path = Some(PathBuf::from(value));
        }

        if let Some(value) = read_env("SLUICE_DEDUP_TTL_MS") {
            self.dedup.dedup_ttl_ms = parse_num("SLUICE_DEDUP_TTL_MS", &value)?;
        }
        if let Some(value) = read_env("SLUICE_BATCH_SIZE") {
            self.dedup.batch_size = parse_num("SLUICE_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("SLUICE_BATCH_TIMEOUT_MS") {
            self.dedup.batch_timeout_ms = parse_num("SLUICE_BATCH_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("SLUICE_MAX_BATCH_WAIT_MS") {
            self.dedup.max_batch_wait_ms = parse_num("SLUICE_MAX_BATCH_WAIT_MS", &value)?;
        }

        if let Some(value) = read_env("SLUICE_HEALTH_ENABLED") {
            self.health.enabled = parse_num("SLUICE_HEALTH_ENABLED", &value)?;
        }
        if let Some(value) = read_env("SLUICE_MEMORY_THRESHOLD_BYTES") {
            self.health.memory_threshold_bytes =
                parse_num("SLUICE_MEMORY_THRESHOLD_BYTES", &value)?;
        }
        if let Some(value) = read_env("SLUICE_CPU_THRESHOLD_PERCENT") {
            self.health.cpu_threshold_percent = parse_num("SLUICE_CPU_THRESHOLD_PERCENT", &value)?;
        }
        if let Some(value) = read_env("SLUICE_ERROR_THRESHOLD_PER_MINUTE") {
            self.health.error_threshold_per_minute =
                parse_num("SLUICE_ERROR_THRESHOLD_PER_MINUTE", &value)?;
        }
        if let Some(value) = read_env("SLUICE_HEALTH_CHECK_INTERVAL_MS") {
            self.health.health_check_interval_ms =
                parse_num("SLUICE_HEALTH_CHECK_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("SLUICE_RESTART_COOLDOWN_MS") {
            self.health.restart_cooldown_ms = parse_num("SLUICE_RESTART_COOLDOWN_MS", &value)?;
        }
        if let Some(value) = read_env("SLUICE_MAX_RESTARTS") {
            self.health.max_restarts = parse_num("SLUICE_MAX_RESTARTS", &value)?;
        }
        if let Some(value) = read_env("SLUICE_GRACEFUL_SHUTDOWN_TIMEOUT_MS") {
            self.health.graceful_shutdown_timeout_ms =
                parse_num("SLUICE_GRACEFUL_SHUTDOWN_TIMEOUT_MS", &value)?;
        }

        let log_level = read_env("SLUICE_LOGGING_LEVEL").or_else(|| read_env("SLUICE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SLUICE_LOGGING_FORMAT").or_else(|| read_env("SLUICE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
        if let Some(role) = overrides.role {
            self.server.role = role;
        }
        if let Some(admin_token) = overrides.admin_token {
            self.server.admin_token = Some(secret_value(admin_token));
        }
        if let Some(upstream_base_url) = overrides.upstream_base_url {
            self.upstream.base_url = upstream_base_url;
        }
        if let Some(max_concurrent_requests) = overrides.max_concurrent_requests {
            self.admission.max_concurrent_requests = max_concurrent_requests;
        }
        if let Some(queue_timeout_ms) = overrides.queue_timeout_ms {
            self.admission.queue_timeout_ms = queue_timeout_ms;
        }
        if let Some(health_enabled) = overrides.health_enabled {
            self.health.enabled = health_enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server(&self.server)?;
        validate_upstream(&self.upstream)?;
        validate_admission(&self.admission)?;
        validate_cache(&self.cache)?;
        validate_dedup(&self.dedup)?;
        validate_health(&self.health)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("sluice.toml"), PathBuf::from("config/sluice.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.role == ProcessRole::Supervisor && server.workers == 0 {
        return Err(ConfigError::Validation(
            "server.workers must be greater than zero in supervisor role".to_string(),
        ));
    }

    let token_blank = server
        .admin_token
        .as_ref()
        .map(|value| value.expose_secret().trim().is_empty())
        .unwrap_or(false);
    if token_blank {
        return Err(ConfigError::Validation(
            "server.admin_token must not be blank when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_upstream(upstream: &UpstreamConfig) -> Result<(), ConfigError> {
    let url = upstream.base_url.trim();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "upstream.base_url must start with http:// or https://".to_string(),
        ));
    }

    if upstream.timeout_secs == 0 || upstream.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "upstream.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if let Some(batch_path) = &upstream.batch_path {
        if !batch_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "upstream.batch_path must start with `/`".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_admission(admission: &AdmissionConfig) -> Result<(), ConfigError> {
    if admission.max_concurrent_requests == 0 {
        return Err(ConfigError::Validation(
            "admission.max_concurrent_requests must be greater than zero".to_string(),
        ));
    }

    if admission.queue_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "admission.queue_timeout_ms must be greater than zero".to_string(),
        ));
    }

    if admission.max_response_size_bytes == 0 {
        return Err(ConfigError::Validation(
            "admission.max_response_size_bytes must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.max_entries == 0 || cache.max_memory_mb == 0 {
        return Err(ConfigError::Validation(
            "cache.max_entries and cache.max_memory_mb must be greater than zero".to_string(),
        ));
    }

    if cache.default_ttl_ms == 0 || cache.sweep_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "cache.default_ttl_ms and cache.sweep_interval_ms must be greater than zero"
                .to_string(),
        ));
    }

    for route in &cache.routes {
        if !route.path_prefix.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "cache route `{}` path_prefix must start with `/`",
                route.name
            )));
        }
        if route.methods.is_empty() {
            return Err(ConfigError::Validation(format!(
                "cache route `{}` must list at least one method",
                route.name
            )));
        }
        if route.ttl_ms == Some(0) {
            return Err(ConfigError::Validation(format!(
                "cache route `{}` ttl_ms must be greater than zero",
                route.name
            )));
        }
    }

    Ok(())
}

fn validate_dedup(dedup: &DedupConfig) -> Result<(), ConfigError> {
    if dedup.batch_size == 0 {
        return Err(ConfigError::Validation(
            "dedup.batch_size must be greater than zero".to_string(),
        ));
    }

    if dedup.batch_timeout_ms == 0 || dedup.max_batch_wait_ms == 0 {
        return Err(ConfigError::Validation(
            "dedup.batch_timeout_ms and dedup.max_batch_wait_ms must be greater than zero"
                .to_string(),
        ));
    }

    if dedup.batch_timeout_ms > dedup.max_batch_wait_ms {
        return Err(ConfigError::Validation(
            "dedup.batch_timeout_ms must not exceed dedup.max_batch_wait_ms".to_string(),
        ));
    }

    Ok(())
}

fn validate_health(health: &HealthConfig) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&health.cpu_threshold_percent) {
        return Err(ConfigError::Validation(
            "health.cpu_threshold_percent must be in range 0..=100".to_string(),
        ));
    }

    if health.health_check_interval_ms == 0 || health.graceful_shutdown_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "health.health_check_interval_ms and health.graceful_shutdown_timeout_ms must be \
             greater than zero"
                .to_string(),
        ));
    }

    if health.memory_breach_samples == 0 || health.cpu_breach_samples == 0 {
        return Err(ConfigError::Validation(
            "health breach sample counts must be greater than zero".to_string(),
        ));
    }

    let longest_streak = health.memory_breach_samples.max(health.cpu_breach_samples);
    if health.sample_window < longest_streak {
        return Err(ConfigError::Validation(format!(
            "health.sample_window must hold at least {longest_streak} samples"
        )));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    upstream: Option<UpstreamPatch>,
    admission: Option<AdmissionPatch>,
    cache: Option<CachePatch>,
    dedup: Option<DedupPatch>,
    health: Option<HealthPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    role: Option<ProcessRole>,
    workers: Option<usize>,
    admin_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamPatch {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    batch_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AdmissionPatch {
    max_concurrent_requests: Option<usize>,
    max_queue_length: Option<usize>,
    queue_timeout_ms: Option<u64>,
    max_response_size_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    max_entries: Option<usize>,
    max_memory_mb: Option<u64>,
    default_ttl_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    routes: Option<Vec<CacheRouteConfig>>,
    snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct DedupPatch {
    dedup_ttl_ms: Option<u64>,
    batch_size: Option<usize>,
    batch_timeout_ms: Option<u64>,
    max_batch_wait_ms: Option<u64>,
    batch_routes: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct HealthPatch {
    enabled: Option<bool>,
    memory_threshold_bytes: Option<u64>,
    cpu_threshold_percent: Option<f32>,
    error_threshold_per_minute: Option<u32>,
    health_check_interval_ms: Option<u64>,
    restart_cooldown_ms: Option<u64>,
    max_restarts: Option<u32>,
    graceful_shutdown_timeout_ms: Option<u64>,
    memory_breach_samples: Option<usize>,
    cpu_breach_samples: Option<usize>,
    sample_window: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
