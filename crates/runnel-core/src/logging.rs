//! Structured logging setup using tracing.
//!
//! Library code only emits events; binaries and test harnesses call
//! [`init_logging`] once to install a subscriber.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::parse_var;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit JSON lines instead of pretty output
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info,runnel_core=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Load from `RUNNEL_LOG` and `RUNNEL_LOG_JSON`
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Ok(filter) = env::var("RUNNEL_LOG") {
            config.log_filter = filter;
        }
        if let Some(json) = parse_var::<bool>("RUNNEL_LOG_JSON") {
            config.json = json;
        }
        config
    }
}

/// Install the global tracing subscriber
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        tracing::subscriber::set_global_default(registry.with(json_layer))
            .context("Failed to set global default subscriber")?;
    } else {
        let fmt_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        tracing::subscriber::set_global_default(registry.with(fmt_layer))
            .context("Failed to set global default subscriber")?;
    }

    info!(
        log_format = if config.json { "json" } else { "pretty" },
        filter = %config.log_filter,
        "Logging initialized"
    );

    Ok(())
}
