mod stats;

pub use stats::{CategorySnapshot, SyncStats, SyncStatsSnapshot};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// How the process logs. Built from the `logging` settings section.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Used when `RUST_LOG` is unset.
    pub log_level: Level,
    pub module_levels: Vec<(String, Level)>,
    /// One JSON object per line on stderr.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// e.g. `info,trail_net=debug`
    pub fn filter_directives(&self) -> String {
        std::iter::once(self.log_level.as_str().to_ascii_lowercase())
            .chain(
                self.module_levels
                    .iter()
                    .map(|(target, level)| format!("{target}={}", level.as_str().to_ascii_lowercase())),
            )
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> EnvFilter {
        match EnvFilter::try_from_default_env() {
            Ok(from_env) => from_env,
            Err(_) => EnvFilter::new(self.filter_directives()),
        }
    }
}

pub fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse().ok()
}

/// Installs the global subscriber writing to stderr. Later calls keep the
/// first subscriber.
pub fn init_telemetry(config: &TelemetryConfig) {
    let base = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let layer = if config.json {
        base.json().with_span_list(true).boxed()
    } else {
        base.compact().boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(layer.with_filter(config.env_filter()))
        .try_init();
    if installed.is_err() {
        tracing::debug!("keeping existing tracing subscriber");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directives_include_module_levels() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("trail_net".into(), Level::DEBUG)],
            json: true,
        };
        assert_eq!(config.filter_directives(), "warn,trail_net=debug");
    }

    #[test]
    fn parse_level_accepts_any_case() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_telemetry(&TelemetryConfig::default());
        init_telemetry(&TelemetryConfig::default());
    }
}
