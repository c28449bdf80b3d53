use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Device API client configuration
    pub api: ApiConfig,

    /// Progress poll configuration
    pub poll: PollConfig,

    /// Log export configuration
    pub export: ExportConfig,
}

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PollConfig {
    pub interval: Duration,
}

#[derive(Clone, Debug)]
pub struct ExportConfig {
    pub log_dir: PathBuf,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it
    /// loads and validates all configuration from environment variables.
    /// Subsequent calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. This is intentional as the
    /// application cannot function without valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        let api = ApiConfig::load()?;
        let poll = PollConfig::load()?;
        let export = ExportConfig::load()?;

        Ok(Self { api, poll, export })
    }
}

impl ApiConfig {
    fn load() -> Result<Self> {
        let base_url = env::var("DEVICE_API_BASE")
            .unwrap_or_else(|_| "http://127.0.0.1:8000/api".to_string());

        let auth_token = env::var("DEVICE_API_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());

        Ok(Self {
            base_url,
            auth_token,
        })
    }
}

impl PollConfig {
    fn load() -> Result<Self> {
        let interval_ms = env::var("POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse::<u64>()
            .context("failed to parse POLL_INTERVAL_MS: invalid format")?;

        Ok(Self {
            interval: Duration::from_millis(interval_ms),
        })
    }
}

impl ExportConfig {
    fn load() -> Result<Self> {
        let log_dir = env::var("LOG_EXPORT_DIR")
            .unwrap_or_else(|_| ".".to_string())
            .into();

        Ok(Self { log_dir })
    }
}
