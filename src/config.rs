use config::{Config as Layers, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub log_level: String,
    pub db_file_name: String,
    pub busy_timeout_ms: u64,
    pub recalculate_on_open: bool,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db_file_name: "nota.sqlite3".to_string(),
            busy_timeout_ms: 5000,
            recalculate_on_open: true,
            workspace: None,
        }
    }
}

impl Config {
    /// Defaults, then `notad.toml` (or `$NOTAD_CONFIG`), then `NOTAD_*`
    /// variables. `RUST_LOG` wins over the configured log level.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let file = std::env::var("NOTAD_CONFIG").unwrap_or_else(|_| "notad".to_string());
        let layers = Layers::builder()
            .set_default("log_level", defaults.log_level)?
            .set_default("db_file_name", defaults.db_file_name)?
            .set_default("busy_timeout_ms", defaults.busy_timeout_ms)?
            .set_default("recalculate_on_open", defaults.recalculate_on_open)?
            .add_source(File::with_name(&file).required(false))
            .add_source(Environment::with_prefix("NOTAD").try_parsing(true))
            .set_override_option("log_level", std::env::var("RUST_LOG").ok())?
            .build()?;
        layers.try_deserialize()
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
