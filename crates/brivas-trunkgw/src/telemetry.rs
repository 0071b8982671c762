//! Log output for the `trunkgw` daemon
//!
//! `TRUNKGW_LOG` sets the level for this crate only (other targets stay at
//! `warn`); `RUST_LOG`, when set, replaces the whole filter.
//! `TRUNKGW_LOG_FORMAT` picks `json`, `pretty` or `compact`.
//! `TRUNKGW_LOG_SPANS=1` logs when an instrumented operation such as
//! `request_channel` closes, with its duration.

use crate::errors::TrunkGwError;
use std::str::FromStr;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the daemon's log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, with the current span's fields flattened
    #[default]
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = TrunkGwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(TrunkGwError::Config(format!("unknown log format {:?}", other))),
        }
    }
}

/// Logging settings read once at daemon start
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Level for `brivas_trunkgw` targets
    pub level: String,
    pub format: LogFormat,
    /// Emit a line when an instrumented span closes
    pub span_timings: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            span_timings: false,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Result<Self, TrunkGwError> {
        let mut config = Self::default();
        if let Ok(level) = std::env::var("TRUNKGW_LOG") {
            config.level = level;
        }
        if let Ok(format) = std::env::var("TRUNKGW_LOG_FORMAT") {
            config.format = format.parse()?;
        }
        config.span_timings = std::env::var("TRUNKGW_LOG_SPANS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Ok(config)
    }

    /// Filter directives for this daemon: its own targets at `level`,
    /// everything else at `warn`
    pub fn directives(&self) -> String {
        format!("warn,{}={}", env!("CARGO_CRATE_NAME"), self.level)
    }

    fn filter(&self) -> Result<EnvFilter, TrunkGwError> {
        if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
            return EnvFilter::try_from_default_env()
                .map_err(|e| TrunkGwError::Config(format!("RUST_LOG: {}", e)));
        }
        EnvFilter::try_new(self.directives())
            .map_err(|e| TrunkGwError::Config(format!("TRUNKGW_LOG: {}", e)))
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_timings {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TrunkGwError> {
    let filter = config.filter()?;
    let registry = tracing_subscriber::registry().with(filter);
    let fmt = tracing_subscriber::fmt::layer().with_span_events(config.span_events());

    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt.json().flatten_event(true).with_current_span(true).with_span_list(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt.pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt.compact().with_target(false)).try_init(),
    };
    installed.map_err(|e| TrunkGwError::Config(format!("tracing init: {}", e)))?;

    tracing::info!(
        level = %config.level,
        format = ?config.format,
        span_timings = config.span_timings,
        "Logging ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_names() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!(" compact ".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!(matches!(
            "syslog".parse::<LogFormat>(),
            Err(TrunkGwError::Config(_))
        ));
    }

    #[test]
    fn test_directives_scope_level_to_this_crate() {
        let config = TelemetryConfig {
            level: "debug".to_string(),
            ..Default::default()
        };
        assert_eq!(config.directives(), "warn,brivas_trunkgw=debug");
        assert!(EnvFilter::try_new(config.directives()).is_ok());
    }

    #[test]
    fn test_span_timings_log_on_close_only() {
        let mut config = TelemetryConfig::default();
        assert_eq!(config.span_events(), FmtSpan::NONE);
        config.span_timings = true;
        assert_eq!(config.span_events(), FmtSpan::CLOSE);
    }
}
