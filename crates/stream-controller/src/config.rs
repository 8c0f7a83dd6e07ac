//! Stream Controller configuration.
//!
//! Configuration is loaded from environment variables. Connection URLs may
//! embed credentials and are redacted in Debug output.

use common::config::{parse_f64_in_range, parse_flag, parse_positive};
use common::secret::SecretString;
use coordinator::directory::parse_static_instances;
use quality_controller::EstimatorConfig;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default heartbeat silence before an SFU instance is unhealthy.
pub const DEFAULT_SFU_HEALTH_TIMEOUT_SECONDS: u64 = 15;

/// Default SFU health check period.
pub const DEFAULT_SFU_HEALTH_CHECK_INTERVAL_SECONDS: u64 = 5;

/// Default SFU directory poll period.
pub const DEFAULT_SFU_DIRECTORY_SYNC_INTERVAL_SECONDS: u64 = 5;

/// Default full membership resync period.
pub const DEFAULT_VIEWER_RESYNC_INTERVAL_SECONDS: u64 = 30;

/// Default SFU selection deadline.
pub const DEFAULT_SELECTION_TIMEOUT_MS: u64 = 250;

/// Default chat write deadline.
pub const DEFAULT_CHAT_WRITE_TIMEOUT_MS: u64 = 50;

/// Default chat read deadline.
pub const DEFAULT_CHAT_READ_TIMEOUT_MS: u64 = 100;

/// Default chat expiry sweep period.
pub const DEFAULT_CHAT_EXPIRY_INTERVAL_SECONDS: u64 = 60;

/// Default graceful drain after readiness flips to false.
pub const DEFAULT_DRAIN_SECONDS: u64 = 0;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sc";

/// Stream Controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Identifier of this replica (default: `sc-<hostname>`).
    pub instance_id: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Redis URL for the viewer event bus and membership ledger.
    /// Unset runs with the in-process bus.
    pub redis_url: Option<SecretString>,

    /// PostgreSQL URL for chat storage. Unset runs with the in-memory store.
    pub database_url: Option<SecretString>,

    pub sfu_health_timeout: Duration,
    pub sfu_health_check_interval: Duration,

    /// Fixed SFU instances (`SC_SFU_INSTANCES=sfu-a=100,sfu-b=250`), kept
    /// alive for as long as this replica runs.
    pub static_sfu_instances: Vec<(String, u32)>,
    pub sfu_directory_sync_interval: Duration,

    pub viewer_resync_interval: Duration,
    pub selection_timeout: Duration,

    /// Concurrent chat writes admitted before `WriteOverload`.
    pub chat_max_inflight_writes: usize,
    pub chat_write_timeout: Duration,
    pub chat_read_timeout: Duration,
    pub chat_expiry_interval: Duration,

    /// Bandwidth estimator tuning for every viewer loop.
    pub quality: EstimatorConfig,

    /// Time between readiness going false and tasks being cancelled.
    pub drain: Duration,

    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
}

/// Custom Debug implementation that redacts connection URLs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |url: &Option<SecretString>| url.as_ref().map(|_| "[REDACTED]");

        f.debug_struct("Config")
            .field("instance_id", &self.instance_id)
            .field("health_bind_address", &self.health_bind_address)
            .field("redis_url", &redacted(&self.redis_url))
            .field("database_url", &redacted(&self.database_url))
            .field("sfu_health_timeout", &self.sfu_health_timeout)
            .field("sfu_health_check_interval", &self.sfu_health_check_interval)
            .field("static_sfu_instances", &self.static_sfu_instances)
            .field("sfu_directory_sync_interval", &self.sfu_directory_sync_interval)
            .field("viewer_resync_interval", &self.viewer_resync_interval)
            .field("selection_timeout", &self.selection_timeout)
            .field("chat_max_inflight_writes", &self.chat_max_inflight_writes)
            .field("chat_write_timeout", &self.chat_write_timeout)
            .field("chat_read_timeout", &self.chat_read_timeout)
            .field("chat_expiry_interval", &self.chat_expiry_interval)
            .field("quality", &self.quality)
            .field("drain", &self.drain)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidValue` if any variable is malformed or out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidValue` if any variable is malformed or out of range.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let instance_id = match vars.get("SC_INSTANCE_ID") {
            Some(id) if id.trim().is_empty() => {
                return Err(ConfigError::InvalidValue(
                    "SC_INSTANCE_ID must not be empty".to_string(),
                ));
            }
            Some(id) => id.clone(),
            None => default_instance_id(vars),
        };

        let health_bind_address = vars
            .get("SC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let redis_url = non_empty_secret(vars, "REDIS_URL");
        let database_url = non_empty_secret(vars, "DATABASE_URL");

        let sfu_health_timeout = Duration::from_secs(positive(
            vars,
            "SFU_HEALTH_TIMEOUT_SECONDS",
            DEFAULT_SFU_HEALTH_TIMEOUT_SECONDS,
        )?);
        let sfu_health_check_interval = Duration::from_secs(positive(
            vars,
            "SFU_HEALTH_CHECK_INTERVAL_SECONDS",
            DEFAULT_SFU_HEALTH_CHECK_INTERVAL_SECONDS,
        )?);
        let static_sfu_instances = match vars.get("SC_SFU_INSTANCES") {
            Some(raw) => parse_static_instances(raw).map_err(|e| {
                ConfigError::InvalidValue(format!("SC_SFU_INSTANCES: {e}"))
            })?,
            None => Vec::new(),
        };
        let sfu_directory_sync_interval = Duration::from_secs(positive(
            vars,
            "SFU_DIRECTORY_SYNC_INTERVAL_SECONDS",
            DEFAULT_SFU_DIRECTORY_SYNC_INTERVAL_SECONDS,
        )?);
        let viewer_resync_interval = Duration::from_secs(positive(
            vars,
            "VIEWER_RESYNC_INTERVAL_SECONDS",
            DEFAULT_VIEWER_RESYNC_INTERVAL_SECONDS,
        )?);
        let selection_timeout = Duration::from_millis(positive(
            vars,
            "SELECTION_TIMEOUT_MS",
            DEFAULT_SELECTION_TIMEOUT_MS,
        )?);

        let chat_max_inflight_writes = parse_positive(
            vars,
            "CHAT_MAX_INFLIGHT_WRITES",
            chat_store::DEFAULT_MAX_INFLIGHT_WRITES,
        )
        .map_err(ConfigError::InvalidValue)?;
        let chat_write_timeout = Duration::from_millis(positive(
            vars,
            "CHAT_WRITE_TIMEOUT_MS",
            DEFAULT_CHAT_WRITE_TIMEOUT_MS,
        )?);
        let chat_read_timeout = Duration::from_millis(positive(
            vars,
            "CHAT_READ_TIMEOUT_MS",
            DEFAULT_CHAT_READ_TIMEOUT_MS,
        )?);
        let chat_expiry_interval = Duration::from_secs(positive(
            vars,
            "CHAT_EXPIRY_INTERVAL_SECONDS",
            DEFAULT_CHAT_EXPIRY_INTERVAL_SECONDS,
        )?);

        let defaults = EstimatorConfig::default();

        // Alpha of zero would freeze the estimate at its first sample
        let alpha = parse_f64_in_range(vars, "QUALITY_EWMA_ALPHA", defaults.alpha, 0.0, 1.0)
            .map_err(ConfigError::InvalidValue)?;
        if alpha <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "QUALITY_EWMA_ALPHA must be greater than 0".to_string(),
            ));
        }

        let loss_threshold = parse_f64_in_range(
            vars,
            "QUALITY_LOSS_THRESHOLD",
            defaults.loss_threshold,
            0.0,
            1.0,
        )
        .map_err(ConfigError::InvalidValue)?;

        let rtt_threshold_ms =
            parse_positive(vars, "QUALITY_RTT_THRESHOLD_MS", defaults.rtt_threshold_ms)
                .map_err(ConfigError::InvalidValue)?;

        let drain_seconds = match vars.get("SC_DRAIN_SECONDS") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "SC_DRAIN_SECONDS must be a non-negative integer, got '{raw}': {e}"
                ))
            })?,
            None => DEFAULT_DRAIN_SECONDS,
        };

        Ok(Config {
            instance_id,
            health_bind_address,
            redis_url,
            database_url,
            sfu_health_timeout,
            sfu_health_check_interval,
            static_sfu_instances,
            sfu_directory_sync_interval,
            viewer_resync_interval,
            selection_timeout,
            chat_max_inflight_writes,
            chat_write_timeout,
            chat_read_timeout,
            chat_expiry_interval,
            quality: EstimatorConfig {
                alpha,
                loss_threshold,
                rtt_threshold_ms,
                rtt_penalty: defaults.rtt_penalty,
            },
            drain: Duration::from_secs(drain_seconds),
            log_json: parse_flag(vars, "SC_LOG_JSON"),
        })
    }
}

fn positive(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, ConfigError> {
    parse_positive(vars, key, default).map_err(ConfigError::InvalidValue)
}

fn non_empty_secret(vars: &HashMap<String, String>, key: &str) -> Option<SecretString> {
    vars.get(key)
        .filter(|v| !v.trim().is_empty())
        .map(|v| SecretString::from(v.clone()))
}

fn default_instance_id(vars: &HashMap<String, String>) -> String {
    match vars.get("HOSTNAME").filter(|h| !h.is_empty()) {
        Some(hostname) => format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}"),
        None => {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!(
                "{DEFAULT_INSTANCE_ID_PREFIX}-{}",
                suffix.get(..8).unwrap_or(&suffix)
            )
        }
    }
}
