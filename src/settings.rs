use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::balance_cache::FixedTtl;

const DEFAULT_CONFIG_FILE: &str = "Config.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Outer deadline for a whole batch.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Exposes `/admin/force-panic`.
    #[serde(default = "default_false")]
    pub enable_debug_routes: bool,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_body_bytes() -> usize {
    1_048_576 // 1 MiB
}
fn default_request_timeout_seconds() -> u64 {
    10
}
fn default_false() -> bool {
    false
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            request_timeout_seconds: default_request_timeout_seconds(),
            enable_debug_routes: default_false(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
    /// Process-wide cap on upstream calls per second. Unset means unthrottled.
    #[serde(default)]
    pub qps_limit: Option<u32>,
}

fn default_call_timeout_seconds() -> u64 {
    8
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            url: String::new(),
            call_timeout_seconds: default_call_timeout_seconds(),
            qps_limit: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Cache {
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
    /// How long a failed lookup is served from cache. Defaults to `ttl_seconds`.
    #[serde(default)]
    pub failure_ttl_seconds: Option<u64>,
}

fn default_cache_ttl_seconds() -> u64 {
    10
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl_seconds(),
            failure_ttl_seconds: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimit {
    #[serde(default = "default_rate_limit")]
    pub limit: u32,
    #[serde(default = "default_rate_window_seconds")]
    pub per_seconds: u64,
}

fn default_rate_limit() -> u32 {
    10
}
fn default_rate_window_seconds() -> u64 {
    60
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            limit: default_rate_limit(),
            per_seconds: default_rate_window_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FanOut {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_max_concurrency() -> usize {
    64
}
fn default_max_batch_size() -> usize {
    2000
}

impl Default for FanOut {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Auth {
    /// Static keys, checked when no database is configured.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_api_key_table")]
    pub table: String,
}

fn default_api_key_table() -> String {
    "api_keys".to_string()
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            database_url: None,
            table: default_api_key_table(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Notify {
    /// Discord-compatible webhook for panic reports.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_false")]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub fan_out: FanOut,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub notify: Notify,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub metrics: Metrics,
}

impl Settings {
    /// Loads `Config.toml` (optional) and the environment.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(DEFAULT_CONFIG_FILE)
    }

    /// Layering, lowest to highest: `path` (optional file), `BALANCE__SECTION__FIELD`
    /// variables, then the flat variables (`PORT`, `RPC_URL`, ...).
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("BALANCE").separator("__"))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_overrides(|name| env::var(name).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Flat variable names used by existing deployments.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(port) = var("PORT") {
            override_parsed("PORT", &port, &mut self.server.port);
        }
        if let Some(url) = var("RPC_URL") {
            self.rpc.url = url;
        }
        // A per-minute limit implies a 60 s window unless the window is set explicitly.
        if let Some(limit) = var("RATE_LIMIT_PER_MIN") {
            if override_parsed("RATE_LIMIT_PER_MIN", &limit, &mut self.rate_limit.limit)
                && var("BALANCE__RATE_LIMIT__PER_SECONDS").is_none()
            {
                self.rate_limit.per_seconds = 60;
            }
        }
        if let Some(ttl) = var("CACHE_TTL_SECONDS") {
            override_parsed("CACHE_TTL_SECONDS", &ttl, &mut self.cache.ttl_seconds);
        }
        if let Some(timeout) = var("REQUEST_TIMEOUT_SECONDS") {
            override_parsed(
                "REQUEST_TIMEOUT_SECONDS",
                &timeout,
                &mut self.server.request_timeout_seconds,
            );
        }
        if let Some(bytes) = var("MAX_BODY_BYTES") {
            override_parsed("MAX_BODY_BYTES", &bytes, &mut self.server.max_body_bytes);
        }
        if let Some(webhook) = var("DISCORD_WEBHOOK_URL") {
            self.notify.webhook_url = Some(webhook);
        }
        if let Some(database_url) = var("DATABASE_URL") {
            self.auth.database_url = Some(database_url);
        }
        if let Some(keys) = var("API_KEYS") {
            self.auth.api_keys = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.url.trim().is_empty() {
            return Err(ConfigError::Message("RPC_URL is required".to_string()));
        }
        url::Url::parse(&self.rpc.url)
            .map_err(|e| ConfigError::Message(format!("invalid rpc.url {}: {}", self.rpc.url, e)))?;
        if self.rate_limit.limit == 0 || self.rate_limit.per_seconds == 0 {
            return Err(ConfigError::Message(
                "rate_limit.limit and rate_limit.per_seconds must be non-zero".to_string(),
            ));
        }
        if self.fan_out.max_concurrency == 0 || self.fan_out.max_batch_size == 0 {
            return Err(ConfigError::Message(
                "fan_out.max_concurrency and fan_out.max_batch_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_policy(&self) -> FixedTtl {
        let ttl = Duration::from_secs(self.cache.ttl_seconds);
        let failure_ttl = self
            .cache
            .failure_ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(ttl);
        FixedTtl::new(ttl).with_failure_ttl(failure_ttl)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.call_timeout_seconds)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.per_seconds)
    }
}

/// Malformed numbers keep the current value.
fn override_parsed<T: std::str::FromStr>(name: &str, raw: &str, target: &mut T) -> bool {
    match raw.parse() {
        Ok(value) => {
            *target = value;
            true
        }
        Err(_) => {
            eprintln!("Ignoring {}={:?}: not a valid number", name, raw);
            false
        }
    }
}
