//! Configuration loading and constants.
//!
//! Loads the optional TOML configuration file, applies CLI overrides and the
//! `PORT` environment variable, and validates the result into a [`WorkerConfig`].
//! `AppConfig` is the root of the file format; `WorkerConfig` is the immutable,
//! validated view the supervisor runs with.

use const_format::formatcp;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Worker Pool Defaults
// =============================================================================

/// Default number of worker processes in the pool
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default upper bound for a single request, in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default idle time a connection is kept open between requests, in seconds
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 2;

/// Default time in-flight requests get to finish during shutdown, in seconds
pub const DEFAULT_GRACEFUL_TIMEOUT_SECS: u64 = 30;

/// Default listen host
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default listen port when `PORT` is not set
pub const DEFAULT_PORT: u16 = 8080;

/// Default bind address (host and port)
pub const DEFAULT_BIND_ADDRESS: &str = formatcp!("{}:{}", DEFAULT_HOST, DEFAULT_PORT);

/// Environment variable the platform uses to hand us a port
pub const PORT_ENV_VAR: &str = "PORT";

// =============================================================================
// Supervisor Timing Constants
// =============================================================================

/// How often the supervisor scans the worker table for stale heartbeats
pub const SUPERVISOR_TICK_MS: u64 = 250;

/// Extra time past the request timeout before a busy worker is evicted.
/// Leaves the worker room to answer 504 itself.
pub const EVICTION_SLACK_MS: u64 = 500;

/// Interval between heartbeats from an idle worker
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

/// Capacity of the worker -> supervisor heartbeat channel
pub const HEARTBEAT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the handle -> supervisor command channel
pub const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Pause after a failed accept() before trying again
pub const ACCEPT_ERROR_DELAY_MS: u64 = 100;

/// Idle time allowed between accepting a connection and reading its first
/// request head. Kept below the probe timeout so silent clients cannot starve
/// the liveness endpoint.
pub const FIRST_REQUEST_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// Restart Backoff Constants
// =============================================================================

/// Two deaths closer together than this count as a restart streak
pub const RESTART_WINDOW_SECS: u64 = 10;

/// First delay applied once restarts start recurring
pub const RESTART_BACKOFF_BASE_MS: u64 = 100;

/// Upper bound on the restart delay
pub const RESTART_BACKOFF_MAX_MS: u64 = 10_000;

/// Consecutive rapid restarts tolerated before the supervisor gives up
pub const RESTART_MAX_STREAK: u32 = 8;

// =============================================================================
// Liveness Probe Constants
// =============================================================================

/// Path answered by workers without reaching the application
pub const LIVENESS_PATH: &str = "/health";

/// Time between probes
pub const PROBE_INTERVAL_SECS: u64 = 30;

/// Per-probe timeout
pub const PROBE_TIMEOUT_SECS: u64 = 10;

/// Consecutive failures before the target is considered down
pub const PROBE_RETRIES: u32 = 3;

/// Failures during this initial window do not count
pub const PROBE_START_PERIOD_SECS: u64 = 5;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "prefork=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Default liveness URL used by the healthcheck subcommand
pub const DEFAULT_HEALTHCHECK_URL: &str =
    formatcp!("http://127.0.0.1:{}{}", DEFAULT_PORT, LIVENESS_PATH);

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Worker pool settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool settings as written in the configuration file.
///
/// Every field is optional; missing values fall back to CLI flags,
/// then to `PORT`, then to the compiled-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Number of workers
    pub workers: Option<usize>,
    /// Request timeout in seconds
    pub timeout_seconds: Option<u64>,
    /// Keep-alive idle time in seconds
    pub keep_alive_seconds: Option<u64>,
    /// Shutdown grace period in seconds
    pub graceful_timeout_seconds: Option<u64>,
    /// host:port to listen on
    pub bind: Option<String>,
}

impl ServerConfig {
    /// Grace period for shutdown (default: 30 seconds)
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(
            self.graceful_timeout_seconds
                .unwrap_or(DEFAULT_GRACEFUL_TIMEOUT_SECS),
        )
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    /// Whether structured JSON output was requested
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;

        if !matches!(config.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Validation(format!(
                "logging.format must be \"text\" or \"json\", got {:?}",
                config.logging.format
            )));
        }

        Ok(config)
    }

    /// Load from `path` when given, otherwise use all defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

/// Values that override the configuration file, typically from the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub workers: Option<usize>,
    pub timeout_seconds: Option<u64>,
    pub keep_alive_seconds: Option<u64>,
    pub bind: Option<String>,
}

/// Validated, immutable worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    count: usize,
    request_timeout: Duration,
    keep_alive: Duration,
    bind_address: String,
}

impl WorkerConfig {
    /// Build a config, rejecting a zero worker count, a zero timeout
    /// or an address that is not of the form `host:port`. The host is
    /// resolved when the listener is bound.
    pub fn new(
        count: usize,
        request_timeout_seconds: u64,
        keep_alive_seconds: u64,
        bind_address: &str,
    ) -> Result<Self, ConfigError> {
        Self::with_durations(
            count,
            Duration::from_secs(request_timeout_seconds),
            Duration::from_secs(keep_alive_seconds),
            bind_address,
        )
    }

    /// Same as [`WorkerConfig::new`] but with sub-second timings.
    pub fn with_durations(
        count: usize,
        request_timeout: Duration,
        keep_alive: Duration,
        bind_address: &str,
    ) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::Validation(
                "worker count must be at least 1".to_string(),
            ));
        }
        if request_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            count,
            request_timeout,
            keep_alive,
            bind_address: parse_bind_address(bind_address)?,
        })
    }

    /// Resolve the effective config. Precedence: overrides > file > `PORT` > defaults.
    pub fn resolve(
        file: &ServerConfig,
        overrides: &Overrides,
        port_env: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let count = overrides
            .workers
            .or(file.workers)
            .unwrap_or(DEFAULT_WORKER_COUNT);
        let timeout = overrides
            .timeout_seconds
            .or(file.timeout_seconds)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        let keep_alive = overrides
            .keep_alive_seconds
            .or(file.keep_alive_seconds)
            .unwrap_or(DEFAULT_KEEP_ALIVE_SECS);

        let bind = match overrides.bind.as_ref().or(file.bind.as_ref()) {
            Some(bind) => bind.clone(),
            None => default_bind_address(port_env)?,
        };

        Self::new(count, timeout, keep_alive, &bind)
    }

    /// Number of workers kept alive
    pub fn count(&self) -> usize {
        self.count
    }

    /// Upper bound for a single request
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Idle time before a kept-alive connection is closed
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// `host:port` of the shared listening socket
    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_WORKER_COUNT,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
        }
    }
}

/// `0.0.0.0:<PORT>`, or the default port when `PORT` is unset or empty.
pub fn default_bind_address(port_env: Option<&str>) -> Result<String, ConfigError> {
    match port_env.map(str::trim).filter(|p| !p.is_empty()) {
        Some(port) => {
            let port: u16 = port.parse().map_err(|_| {
                ConfigError::Validation(format!("{} is not a valid port: {:?}", PORT_ENV_VAR, port))
            })?;
            Ok(format!("{}:{}", DEFAULT_HOST, port))
        }
        None => Ok(DEFAULT_BIND_ADDRESS.to_string()),
    }
}

/// Check the `host:port` shape. Bracketed IPv6 hosts are accepted.
fn parse_bind_address(bind: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidBindAddress(bind.to_string());
    let (host, port) = bind.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid());
    }
    port.parse::<u16>().map_err(|_| invalid())?;
    Ok(bind.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
    #[error("Invalid bind address: {0:?} (expected host:port)")]
    InvalidBindAddress(String),
    #[error("Failed to resolve bind address {addr:?}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_entry_contract() {
        let config = WorkerConfig::default();
        assert_eq!(config.count(), 2);
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
        assert_eq!(config.keep_alive(), Duration::from_secs(2));
        assert_eq!(config.bind_address().to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn test_resolve_with_nothing_set_is_default() {
        let config =
            WorkerConfig::resolve(&ServerConfig::default(), &Overrides::default(), None).unwrap();
        assert_eq!(config, WorkerConfig::default());
    }

    #[test]
    fn test_port_env_sets_default_bind() {
        let config = WorkerConfig::resolve(
            &ServerConfig::default(),
            &Overrides::default(),
            Some("9191"),
        )
        .unwrap();
        assert_eq!(config.bind_address().to_string(), "0.0.0.0:9191");
    }

    #[test]
    fn test_empty_port_env_falls_back() {
        assert_eq!(default_bind_address(Some("  ")).unwrap(), "0.0.0.0:8080");
    }

    #[test]
    fn test_bad_port_env_is_rejected() {
        assert!(matches!(
            default_bind_address(Some("eighty")),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_override_beats_file_beats_env() {
        let file = ServerConfig {
            workers: Some(4),
            bind: Some("127.0.0.1:7000".to_string()),
            ..Default::default()
        };
        let overrides = Overrides {
            workers: Some(6),
            ..Default::default()
        };
        let config = WorkerConfig::resolve(&file, &overrides, Some("9000")).unwrap();
        assert_eq!(config.count(), 6);
        assert_eq!(config.bind_address().to_string(), "127.0.0.1:7000");
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            WorkerConfig::new(0, 120, 2, "0.0.0.0:8080"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(matches!(
            WorkerConfig::new(2, 0, 2, "0.0.0.0:8080"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_keep_alive_allowed() {
        let config = WorkerConfig::new(1, 5, 0, "127.0.0.1:0").unwrap();
        assert!(config.keep_alive().is_zero());
    }

    #[test]
    fn test_invalid_bind_address_rejected() {
        for bad in [
            "",
            "localhost",
            "0.0.0.0",
            "0.0.0.0:99999",
            ":8080",
            "not an address:80",
            "::1:8080",
        ] {
            assert!(
                matches!(
                    WorkerConfig::new(1, 5, 2, bad),
                    Err(ConfigError::InvalidBindAddress(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_hostname_bind_address_accepted() {
        for good in ["localhost:8080", "example.internal:80", "[::1]:0", "127.0.0.1:0"] {
            let config = WorkerConfig::new(1, 5, 2, good).unwrap();
            assert_eq!(config.bind_address(), good);
        }
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
workers = 3
timeout_seconds = 30
keep_alive_seconds = 5
graceful_timeout_seconds = 10
bind = "127.0.0.1:8181"

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert!(config.logging.is_json());
        assert_eq!(config.server.graceful_timeout(), Duration::from_secs(10));

        let worker = WorkerConfig::resolve(&config.server, &Overrides::default(), None).unwrap();
        assert_eq!(worker.count(), 3);
        assert_eq!(worker.request_timeout(), Duration::from_secs(30));
        assert_eq!(worker.keep_alive(), Duration::from_secs(5));
        assert_eq!(worker.bind_address().to_string(), "127.0.0.1:8181");
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert!(!config.logging.is_json());
        assert_eq!(
            config.server.graceful_timeout(),
            Duration::from_secs(DEFAULT_GRACEFUL_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nformat = \"xml\"").unwrap();
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            AppConfig::load("/definitely/not/here.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_negative_workers_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nworkers = -1").unwrap();
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
