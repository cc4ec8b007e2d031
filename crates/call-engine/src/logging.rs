use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;
use crate::error::{CallEngineError, Result};

/// Configuration for the tracing subscriber
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub json: bool,
    pub file_info: bool,
    pub log_spans: bool,
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "crm-call-engine".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Build from the `[logging]` section of the engine configuration.
    pub fn from_config(config: &LogConfig, app_name: impl Into<String>) -> Result<Self> {
        let mut logging = Self::new(parse_log_level(&config.level)?, app_name);
        logging.json = config.json;
        logging.file_info = config.file_info;
        Ok(logging)
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Install the global subscriber. `RUST_LOG` directives are honored on top
/// of the configured level.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };

    installed.map_err(|e| CallEngineError::configuration(format!("logging already initialized: {e}")))
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level)
        .map_err(|_| CallEngineError::configuration(format!("Invalid log level: {}", level)))
}

pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("📞 Starting {} v{}", app_name, version);
}
