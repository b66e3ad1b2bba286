use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// All crates of the workspace, which receive the configured log level.
///
/// Third-party crates only log at `INFO` and above unless `RUST_LOG` says otherwise.
const CRATE_NAMES: &[&str] = &[
    "rollup",
    "rollup_collector",
    "rollup_config",
    "rollup_log",
    "rollup_worker",
];

/// Controls the log format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    #[default]
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  rollup::tracker > flush worker started
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2024-03-04T12:10:32Z  INFO rollup::tracker: flush worker started
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2024-03-04T12:11:08.729716Z","level":"INFO","fields":{"message":"flush worker started"},"target":"rollup::tracker"}
    /// ```
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// The log level for all rollup crates.
    #[serde(with = "level_serde")]
    pub level: LevelFilter,

    /// Controls the log output format.
    ///
    /// Defaults to [`LogFormat::Auto`], which detects the best format based on the TTY.
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Returns the default filter directives for the given level.
///
/// All crates of the workspace log at `level`, everything else at `INFO`. If `level` is more
/// restrictive than `INFO`, it applies to all crates.
pub fn default_directives(level: LevelFilter) -> String {
    let base = level.min(LevelFilter::INFO);
    let mut directives = base.to_string().to_lowercase();

    for name in CRATE_NAMES {
        directives.push_str(&format!(",{name}={}", level.to_string().to_lowercase()));
    }

    directives
}

/// Initialize the logging system.
///
/// The first call installs a global subscriber, subsequent calls have no effect. The `RUST_LOG`
/// environment variable takes precedence over the configured level.
///
/// # Example
///
/// ```ignore
/// let log_config = rollup_log::LogConfig {
///     format: rollup_log::LogFormat::Json,
///     ..Default::default()
/// };
///
/// rollup_log::init(&log_config);
/// ```
#[cfg(feature = "init")]
pub fn init(config: &LogConfig) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config.level)));

    let format = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let format = match (config.format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => format.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            format.with_ansi(false).compact().boxed()
        }
        (LogFormat::Json, _) => format
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(format.with_filter(filter))
        .try_init()
        .ok();
}

mod level_serde {
    use std::fmt;

    use serde::de::{Error, Unexpected, Visitor};
    use serde::{Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    pub fn serialize<S>(filter: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&filter.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl Visitor<'_> for V {
            type Value = LevelFilter;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a log level")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: Error,
            {
                value
                    .parse()
                    .map_err(|_| Error::invalid_value(Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_str(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(
            default_directives(LevelFilter::DEBUG),
            "info,rollup=debug,rollup_collector=debug,rollup_config=debug,rollup_log=debug,rollup_worker=debug"
        );
    }

    #[test]
    fn test_default_directives_restrictive() {
        let directives = default_directives(LevelFilter::WARN);
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("rollup_worker=warn"));
    }

    #[test]
    fn test_level_serde() {
        let config: LogConfig =
            serde_json::from_str(r#"{"level": "off", "format": "json"}"#).unwrap();
        assert_eq!(config.level, LevelFilter::OFF);
        assert_eq!(config.format, LogFormat::Json);

        let json = serde_json::to_string(&LogConfig::default()).unwrap();
        assert_eq!(
            json,
            r#"{"level":"info","format":"auto"}"#
        );
    }

    #[test]
    fn test_level_serde_invalid() {
        let result = serde_json::from_str::<LogConfig>(r#"{"level": "loud"}"#);
        assert!(result.is_err());
    }
}
