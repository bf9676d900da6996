use clap::Parser;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

use crate::rate_limit::{LimiterSettings, MAX_PERIOD};

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "api-gatekeeper")]
#[command(about = "API key authentication and per-client rate limiting in front of a backend")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "GATEKEEPER_PORT", default_value_t = 8080)]
    pub port: u16,

    // Backend servers (comma-separated)
    // Example: "localhost:3000,localhost:3001"
    #[arg(short, long, env = "GATEKEEPER_BACKENDS", default_value = "localhost:3000")]
    pub backends: String,

    // API keys as comma-separated key=identity pairs
    // Example: "sk-xyz=client-1,sk-abc=client-2"
    #[arg(long, env = "GATEKEEPER_API_KEYS", hide_env_values = true)]
    pub api_keys: String,

    // Max admitted requests per client per window
    #[arg(long, env = "GATEKEEPER_RATE_LIMIT", default_value_t = 60)]
    pub rate_limit: u32,

    // Rate limit window in seconds
    #[arg(long, env = "GATEKEEPER_RATE_WINDOW", default_value_t = 60)]
    pub rate_window: u64,

    // Sweep period in seconds (defaults to the window length)
    #[arg(long, env = "GATEKEEPER_SWEEP_INTERVAL")]
    pub sweep_interval: Option<u64>,

    // Path that bypasses authentication and rate limiting
    #[arg(long, env = "GATEKEEPER_HEALTH_PATH", default_value = "/health")]
    pub health_path: String,

    // Path requested on each backend by the health checker
    #[arg(long, env = "GATEKEEPER_BACKEND_HEALTH_PATH", default_value = "/health")]
    pub backend_health_path: String,

    // Upstream health check interval in seconds
    #[arg(long, env = "GATEKEEPER_HEALTH_INTERVAL", default_value_t = 30)]
    pub health_interval: u64,

    // Largest request body forwarded upstream
    #[arg(long, env = "GATEKEEPER_MAX_BODY_BYTES", default_value_t = 1024 * 1024)]
    pub max_body_bytes: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("API key entry {0:?} is missing the '=' separator")]
    MissingSeparator(String),

    #[error("API key entry {0:?} has an empty key")]
    EmptyKey(String),

    #[error("API key entry {0:?} has an empty client identity")]
    EmptyIdentity(String),

    #[error("API key for client {0:?} is configured more than once")]
    DuplicateKey(String),

    #[error("no API keys configured")]
    EmptyRegistry,

    #[error("rate limit must be at least 1 request per window")]
    ZeroRateLimit,

    #[error("{0} must be at least 1 second")]
    ZeroDuration(&'static str),

    #[error("{0} must be at most {1} seconds")]
    DurationTooLong(&'static str, u64),

    #[error("health path must start with '/', got {0:?}")]
    InvalidHealthPath(String),
}

impl Args {
    pub fn limiter_settings(&self) -> Result<LimiterSettings, ConfigError> {
        let max_per_window = NonZeroU32::new(self.rate_limit).ok_or(ConfigError::ZeroRateLimit)?;
        let window = period("rate window", self.rate_window)?;
        let sweep_interval = period(
            "sweep interval",
            self.sweep_interval.unwrap_or(self.rate_window),
        )?;

        Ok(LimiterSettings {
            max_per_window,
            window,
            sweep_interval,
        })
    }

    pub fn health_check_interval(&self) -> Result<Duration, ConfigError> {
        period("health interval", self.health_interval)
    }

    pub fn validated_health_path(&self) -> Result<String, ConfigError> {
        if !self.health_path.starts_with('/') {
            return Err(ConfigError::InvalidHealthPath(self.health_path.clone()));
        }
        Ok(self.health_path.clone())
    }
}

// Between 1 second and MAX_PERIOD, so Instant arithmetic can't overflow
fn period(name: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::ZeroDuration(name));
    }
    let duration = Duration::from_secs(secs);
    if duration > MAX_PERIOD {
        return Err(ConfigError::DurationTooLong(name, MAX_PERIOD.as_secs()));
    }
    Ok(duration)
}
