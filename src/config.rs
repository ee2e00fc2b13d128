use config::{Config, File};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::{EngineSettings, GridConfig, GridResult, PaperSettings, RawGridConfig};

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Grid definition, validated into [`GridConfig`] by [`Settings::grid_config`]
    pub grid: RawGridConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Timers, retry policy and concurrency
    #[serde(default)]
    pub engine: EngineSettings,
    /// Simulated exchange used by the CLI
    #[serde(default)]
    pub paper: PaperConfig,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PaperConfig {
    /// Simulated account
    #[serde(default)]
    pub account: PaperSettings,
    /// Price series replayed into the paper exchange, one price per line
    #[serde(default)]
    pub prices_file: Option<String>,
    /// Delay between replayed prices
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Starting price when no price file is given
    #[serde(default)]
    pub start_price: Option<f64>,
}

fn default_tick_ms() -> u64 {
    500
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            account: PaperSettings::default(),
            prices_file: None,
            tick_ms: default_tick_ms(),
            start_price: None,
        }
    }
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment overrides, e.g. APP_GRID__LEVERAGE=5
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Validated grid configuration
    pub fn grid_config(&self) -> GridResult<GridConfig> {
        GridConfig::try_from(self.grid.clone())
    }
}
