//! Service configuration sourced from the environment with CLI overrides
//!
//! This module provides all configuration structures for the rendering
//! service, including pool sizing, rate limiting, HTTP binding, and the
//! Chrome launch profile used for every pooled browser process.

use crate::error::RenderError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for the rendering service
///
/// Every field has a production-sensible default and can be overridden with
/// an environment variable. CLI flags take precedence over the environment.
///
/// # Examples
///
/// ```rust
/// use renderd::Config;
///
/// // Defaults only
/// let config = Config::default();
///
/// // Custom pool shape
/// let config = Config {
///     pool: renderd::PoolSettings {
///         max_browsers: 5,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Address the HTTP listener binds to (default: 0.0.0.0)
    pub host: String,

    /// Port the HTTP listener binds to (default: 3000)
    pub port: u16,

    /// Whether permissive CORS headers are attached to responses (default: true)
    pub cors_enabled: bool,

    /// Browser pool sizing and lifecycle settings
    pub pool: PoolSettings,

    /// Per-client admission control settings
    pub rate_limit: RateLimitSettings,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Default deadline for a queued lease acquisition (default: 30 seconds)
    pub acquire_queue_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_enabled: true,
            pool: PoolSettings::default(),
            rate_limit: RateLimitSettings::default(),
            chrome_path: None,
            acquire_queue_timeout: Duration::from_secs(30),
        }
    }
}

/// Browser pool sizing and lifecycle settings
///
/// The pool keeps between `min_browsers` and `max_browsers` Chrome processes
/// alive, each carrying up to `max_contexts_per_browser` concurrent leases.
/// Idle processes above the minimum are reclaimed after `idle_timeout`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Minimum browser processes kept alive (default: 1)
    pub min_browsers: usize,

    /// Maximum browser processes ever launched (default: 3)
    pub max_browsers: usize,

    /// Maximum concurrent leases per browser process (default: 5)
    pub max_contexts_per_browser: usize,

    /// Idle time after which a surplus browser is closed (default: 5 minutes)
    pub idle_timeout: Duration,

    /// Interval between pool health sweeps (default: 30 seconds)
    pub health_check_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_browsers: 1,
            max_browsers: 3,
            max_contexts_per_browser: 5,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Per-client fixed-window admission settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitSettings {
    /// Whether admission control is active (default: true)
    pub enabled: bool,

    /// Window length (default: 60 seconds)
    pub window: Duration,

    /// Requests admitted per client per window (default: 30)
    pub max_requests: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 30,
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    ///
    /// Recognized variables: `PORT`, `HOST`, `CORS_ENABLED`,
    /// `POOL_MIN_BROWSERS`, `POOL_MAX_BROWSERS`, `POOL_MAX_CONTEXTS`,
    /// `BROWSER_IDLE_TIMEOUT`, `HEALTH_CHECK_INTERVAL`,
    /// `RATE_LIMIT_ENABLED`, `RATE_LIMIT_WINDOW_MS`,
    /// `RATE_LIMIT_MAX_REQUESTS`, `CHROME_PATH`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string("HOST", defaults.host),
            port: env_parse("PORT", defaults.port),
            cors_enabled: env_bool("CORS_ENABLED", defaults.cors_enabled),
            pool: PoolSettings {
                min_browsers: env_parse("POOL_MIN_BROWSERS", defaults.pool.min_browsers),
                max_browsers: env_parse("POOL_MAX_BROWSERS", defaults.pool.max_browsers),
                max_contexts_per_browser: env_parse(
                    "POOL_MAX_CONTEXTS",
                    defaults.pool.max_contexts_per_browser,
                ),
                idle_timeout: Duration::from_millis(env_parse(
                    "BROWSER_IDLE_TIMEOUT",
                    defaults.pool.idle_timeout.as_millis() as u64,
                )),
                health_check_interval: Duration::from_millis(env_parse(
                    "HEALTH_CHECK_INTERVAL",
                    defaults.pool.health_check_interval.as_millis() as u64,
                )),
            },
            rate_limit: RateLimitSettings {
                enabled: env_bool("RATE_LIMIT_ENABLED", defaults.rate_limit.enabled),
                window: Duration::from_millis(env_parse(
                    "RATE_LIMIT_WINDOW_MS",
                    defaults.rate_limit.window.as_millis() as u64,
                )),
                max_requests: env_parse(
                    "RATE_LIMIT_MAX_REQUESTS",
                    defaults.rate_limit.max_requests,
                ),
            },
            chrome_path: std::env::var("CHROME_PATH").ok().filter(|p| !p.is_empty()),
            acquire_queue_timeout: defaults.acquire_queue_timeout,
        }
    }

    /// Reject configurations that cannot produce a working service.
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.pool.max_browsers == 0 {
            return Err(RenderError::ConfigurationError(
                "POOL_MAX_BROWSERS must be greater than 0".to_string(),
            ));
        }
        if self.pool.min_browsers > self.pool.max_browsers {
            return Err(RenderError::ConfigurationError(
                "POOL_MIN_BROWSERS must not exceed POOL_MAX_BROWSERS".to_string(),
            ));
        }
        if self.pool.max_contexts_per_browser == 0 {
            return Err(RenderError::ConfigurationError(
                "POOL_MAX_CONTEXTS must be greater than 0".to_string(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.max_requests == 0 {
            return Err(RenderError::ConfigurationError(
                "RATE_LIMIT_MAX_REQUESTS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Generate Chrome command-line arguments for one pooled browser process
///
/// The argument set is tuned for container operation: headless, sandbox and
/// GPU flags relaxed, automation surface disabled, unique profile and
/// debugging port per instance so concurrent processes never collide.
pub fn chrome_args(instance_seq: usize, proxy_server: Option<&str>) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_seq);

    let mut args = vec![
        "--headless=new".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--mute-audio".to_string(),
        "--hide-scrollbars".to_string(),
        "--ignore-certificate-errors".to_string(),
        "--memory-pressure-off".to_string(),
        // Unique profile directory to avoid singleton issues
        format!("--user-data-dir=/tmp/renderd-profile-{unique_id}"),
        format!("--remote-debugging-port={}", 9222 + instance_seq % 1000),
    ];

    if let Some(server) = proxy_server {
        args.push(format!("--proxy-server={server}"));
    }

    args
}

/// Build the chromiumoxide launch configuration for one pool instance.
pub fn create_browser_config(
    config: &Config,
    instance_seq: usize,
    proxy_server: Option<&str>,
) -> Result<chromiumoxide::browser::BrowserConfig, RenderError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder().args(chrome_args(instance_seq, proxy_server));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(RenderError::LaunchFailed)
}
