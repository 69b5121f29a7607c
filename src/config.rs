//! Configuration management for Gatekeeper.
//!
//! Configuration is assembled once at startup from built-in defaults, an
//! optional YAML file and `GATEKEEPER_*` environment variables, then frozen.
//! Nested keys use `__` in environment variables, e.g.
//! `GATEKEEPER_LIMITS__DEFAULT_LIMIT=20`.
//!
//! Unprefixed deployment variables are not read. An existing `.env` written
//! for the bare names must be renamed:
//!
//! | Bare name        | Gatekeeper variable                      |
//! |------------------|------------------------------------------|
//! | `MODE`           | `GATEKEEPER_LIMITS__MODE`                |
//! | `DEFAULT_LIMIT`  | `GATEKEEPER_LIMITS__DEFAULT_LIMIT`       |
//! | `DEFAULT_WINDOW` | `GATEKEEPER_LIMITS__DEFAULT_WINDOW_SECS` |
//! | `DEFAULT_BLOCK`  | `GATEKEEPER_LIMITS__DEFAULT_BLOCK_SECS`  |
//! | `TOKEN_LIMITS`   | `GATEKEEPER_LIMITS__TOKEN_LIMITS`        |
//! | `REDIS_ADDR`     | `GATEKEEPER_STORE__REDIS_ADDR`           |
//! | `REDIS_PASSWORD` | `GATEKEEPER_STORE__REDIS_PASSWORD`       |
//! | `REDIS_DB`       | `GATEKEEPER_STORE__REDIS_DB`             |
//! | `SERVER_ADDR`    | `GATEKEEPER_SERVER__HTTP_ADDR`           |
//!
//! Setting any Redis variable does not select the Redis backend on its own;
//! also set `GATEKEEPER_STORE__BACKEND=redis`.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{Mode, PolicyConfig, RateRule, TokenRules};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limit policy configuration
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Store backend configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Request header carrying the API token
    #[serde(default = "default_token_header")]
    pub token_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            token_header: default_token_header(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_token_header() -> String {
    "API_KEY".to_string()
}

/// Rate limit policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Fallback behaviour when no token rule matches
    #[serde(default)]
    pub mode: Mode,

    /// Requests allowed per window for IP identities
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Counting window in seconds
    #[serde(default = "default_window_secs")]
    pub default_window_secs: u64,

    /// Block duration in seconds once the limit is exceeded
    #[serde(default = "default_block_secs")]
    pub default_block_secs: u64,

    /// Token rules in `token:limit:window:block[,...]` form
    #[serde(default)]
    pub token_limits: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            default_limit: default_limit(),
            default_window_secs: default_window_secs(),
            default_block_secs: default_block_secs(),
            token_limits: String::new(),
        }
    }
}

fn default_limit() -> u64 {
    10
}

fn default_window_secs() -> u64 {
    1
}

fn default_block_secs() -> u64 {
    300
}

impl LimitsConfig {
    /// Build the immutable policy used by the rate limiter.
    pub fn to_policy(&self) -> Result<PolicyConfig> {
        if self.default_window_secs == 0 {
            return Err(GatekeeperError::Config(
                "limits.default_window_secs must be greater than zero".to_string(),
            ));
        }

        let token_rules = TokenRules::parse(&self.token_limits);
        info!(
            mode = %self.mode,
            default_limit = self.default_limit,
            default_window_secs = self.default_window_secs,
            default_block_secs = self.default_block_secs,
            token_rules = token_rules.len(),
            "Rate limit policy loaded"
        );

        Ok(PolicyConfig::new(
            self.mode,
            RateRule::from_secs(
                self.default_limit,
                self.default_window_secs,
                self.default_block_secs,
            ),
            token_rules,
        ))
    }
}

/// Which store backend holds counters and block markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process maps; state is not shared between instances
    #[default]
    Memory,
    /// Redis, shared between instances
    Redis,
}

/// Store backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis address as `host:port`
    #[serde(default = "default_redis_addr")]
    pub redis_addr: String,

    #[serde(default)]
    pub redis_password: Option<String>,

    #[serde(default)]
    pub redis_db: i64,

    /// How often the memory backend purges expired entries, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_addr: default_redis_addr(),
            redis_password: None,
            redis_db: 0,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_redis_addr() -> String {
    "localhost:6379".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl StoreConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl GatekeeperConfig {
    /// Load configuration from an optional file plus the process environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env(path, env_source())
    }

    fn load_with_env(path: Option<&str>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(File::with_name(path));
        }

        let config: GatekeeperConfig = builder.add_source(env).build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GatekeeperError::Config(e.to_string()))
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
