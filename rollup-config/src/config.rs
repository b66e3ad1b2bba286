use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rollup_collector::Percentile;
use rollup_log::LogConfig;
use rollup_worker::StartPolicy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::suites::{Suite, Suites};

type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an environment variable).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
    /// The tag list is not formatted as `key=value` pairs.
    #[error("invalid tag configuration, expected a list like foo=bar,baz=qux")]
    InvalidTags,
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<BoxError>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: Some(cause.into()),
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Into<BoxError>,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_ref().map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

/// A configuration object stored as a YAML file.
trait ConfigObject: DeserializeOwned + Serialize {
    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.yml", Self::name()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))
    }

    /// Writes the configuration object to the given writer.
    fn write<W: Write>(&self, writer: &mut W) -> Result<(), ConfigError> {
        serde_yaml::to_writer(writer, self)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Writes the configuration to a file within the given directory location.
    fn save(&self, base: &Path) -> Result<(), ConfigError> {
        let path = Self::path(base);
        let mut f = fs::File::create(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(&path))?;

        self.write(&mut f).map_err(|e| e.file(&path))?;
        f.write_all(b"\n").ok();

        Ok(())
    }
}

/// The execution context of the flush worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventMode {
    /// A dedicated background thread.
    #[default]
    Thread,
    /// A timer task on an async runtime, running flushes on its blocking pool.
    Reactor,
    /// A task on an async runtime, running flushes inline.
    Cooperative,
}

impl EventMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "thread" => Some(Self::Thread),
            "reactor" => Some(Self::Reactor),
            "cooperative" => Some(Self::Cooperative),
            _ => None,
        }
    }
}

fn default_flush_interval() -> u64 {
    60
}

fn default_percentiles() -> Vec<Percentile> {
    vec![Percentile::P95]
}

fn default_retry_batches() -> usize {
    1
}

/// Config struct.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigValues {
    /// Interval between flushes in seconds.
    pub flush_interval: u64,
    /// Prefix of all submitted metric names.
    pub prefix: Option<String>,
    /// Prefix of all `source` tags.
    pub source_prefix: Option<String>,
    /// Tags attached to submitted metrics.
    pub tags: BTreeMap<String, String>,
    /// Percentiles reported for timed metrics.
    pub percentiles: Vec<Percentile>,
    /// Enabled instrumentation suites.
    pub suites: Suites,
    /// The execution context of the flush worker.
    pub event_mode: EventMode,
    /// When the first flush happens.
    pub start: StartPolicy,
    /// Keeps the state of the collector on flush.
    pub preserve_on_flush: bool,
    /// The number of failed batches kept for another submission attempt.
    pub retry_batches: usize,
    /// Starts the flush worker on construction. Detected if not set.
    pub autorun: Option<bool>,
    /// Logging configuration.
    pub logging: LogConfig,
}

impl Default for ConfigValues {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            prefix: None,
            source_prefix: None,
            tags: BTreeMap::new(),
            percentiles: default_percentiles(),
            suites: Suites::default(),
            event_mode: EventMode::default(),
            start: StartPolicy::default(),
            preserve_on_flush: false,
            retry_batches: default_retry_batches(),
            autorun: None,
            logging: LogConfig::default(),
        }
    }
}

impl ConfigObject for ConfigValues {
    fn name() -> &'static str {
        "config"
    }
}

/// Parses a tag list formatted as `key=value` pairs separated by commas.
pub fn parse_tags(value: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut tags = BTreeMap::new();

    for pair in value.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
                tags.insert(key.trim().to_owned(), value.trim().to_owned());
            }
            _ => return Err(ConfigError::new(ConfigErrorKind::InvalidTags).field("tags")),
        }
    }

    Ok(tags)
}

/// Structure used to hold information about configuration overrides via environment variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverridableConfig {
    /// `ROLLUP_FLUSH_INTERVAL`
    pub flush_interval: Option<String>,
    /// `ROLLUP_PREFIX`
    pub prefix: Option<String>,
    /// `ROLLUP_SOURCE_PREFIX`
    pub source_prefix: Option<String>,
    /// `ROLLUP_TAGS`
    pub tags: Option<String>,
    /// `ROLLUP_PERCENTILES`
    pub percentiles: Option<String>,
    /// `ROLLUP_SUITES`
    pub suites: Option<String>,
    /// `ROLLUP_EVENT_MODE`
    pub event_mode: Option<String>,
    /// `ROLLUP_LOG_LEVEL`
    pub log_level: Option<String>,
    /// `ROLLUP_AUTORUN`
    pub autorun: Option<String>,
}

impl OverridableConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads overrides with a custom variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            flush_interval: lookup("ROLLUP_FLUSH_INTERVAL"),
            prefix: lookup("ROLLUP_PREFIX"),
            source_prefix: lookup("ROLLUP_SOURCE_PREFIX"),
            tags: lookup("ROLLUP_TAGS"),
            percentiles: lookup("ROLLUP_PERCENTILES"),
            suites: lookup("ROLLUP_SUITES"),
            event_mode: lookup("ROLLUP_EVENT_MODE"),
            log_level: lookup("ROLLUP_LOG_LEVEL"),
            autorun: lookup("ROLLUP_AUTORUN"),
        }
    }
}

/// Configuration of the metrics collector.
#[derive(Clone, Debug, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl Config {
    /// Loads a config from a given config folder.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        Ok(Config {
            values: ConfigValues::load(&path)?,
            path,
        })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from environment variables.
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let values = &mut self.values;

        if let Some(flush_interval) = overrides.flush_interval {
            values.flush_interval = flush_interval
                .trim()
                .parse()
                .map_err(|err| ConfigError::for_field(err, "flush_interval"))?;
        }

        if let Some(prefix) = overrides.prefix {
            values.prefix = Some(prefix).filter(|p| !p.is_empty());
        }

        if let Some(source_prefix) = overrides.source_prefix {
            values.source_prefix = Some(source_prefix).filter(|p| !p.is_empty());
        }

        if let Some(tags) = overrides.tags {
            values.tags = parse_tags(&tags)?;
        }

        if let Some(percentiles) = overrides.percentiles {
            values.percentiles = percentiles
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| {
                    let number = p
                        .parse::<f64>()
                        .map_err(|err| ConfigError::for_field(err, "percentiles"))?;
                    Percentile::new(number).map_err(|err| ConfigError::for_field(err, "percentiles"))
                })
                .collect::<Result<_, _>>()?;
        }

        if let Some(suites) = overrides.suites {
            values.suites = suites
                .parse()
                .map_err(|err| ConfigError::for_field(err, "suites"))?;
        }

        if let Some(event_mode) = overrides.event_mode {
            match EventMode::parse(&event_mode) {
                Some(mode) => values.event_mode = mode,
                None => rollup_log::warn!(value = %event_mode, "ignoring unknown event mode"),
            }
        }

        if let Some(log_level) = overrides.log_level {
            values.logging.level = log_level
                .trim()
                .parse()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        if let Some(autorun) = overrides.autorun {
            values.autorun = match autorun.trim() {
                "1" | "TRUE" => Some(true),
                "0" | "FALSE" => Some(false),
                _ => None,
            };
        }

        Ok(self)
    }

    /// Returns the filename of the config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Writes the values back to `config.yml` in the given folder.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        self.values.save(path.as_ref())
    }

    /// Returns the raw values.
    pub fn values(&self) -> &ConfigValues {
        &self.values
    }

    /// Returns the interval between flushes.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.values.flush_interval)
    }

    /// Returns the prefix of submitted metric names.
    pub fn prefix(&self) -> Option<&str> {
        self.values.prefix.as_deref()
    }

    /// Replaces the prefix of submitted metric names.
    pub fn set_prefix(&mut self, prefix: Option<String>) {
        self.values.prefix = prefix.filter(|p| !p.is_empty());
    }

    /// Returns the prefix of `source` tags.
    pub fn source_prefix(&self) -> Option<&str> {
        self.values.source_prefix.as_deref()
    }

    /// Returns the tags attached to submitted metrics.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.values.tags
    }

    /// Returns `true` if tags are configured.
    pub fn has_tags(&self) -> bool {
        !self.values.tags.is_empty()
    }

    /// Returns the percentiles reported for timed metrics.
    pub fn percentiles(&self) -> &[Percentile] {
        &self.values.percentiles
    }

    /// Returns the enabled suites.
    pub fn suites(&self) -> Suites {
        self.values.suites
    }

    /// Returns `true` if the given suite is enabled.
    pub fn suite_enabled(&self, suite: Suite) -> bool {
        self.values.suites.enabled(suite)
    }

    /// Returns the execution context of the flush worker.
    pub fn event_mode(&self) -> EventMode {
        self.values.event_mode
    }

    /// Returns the policy for the first flush.
    pub fn start_policy(&self) -> StartPolicy {
        self.values.start
    }

    /// Returns `true` if flushes keep the state of the collector.
    pub fn preserve_on_flush(&self) -> bool {
        self.values.preserve_on_flush
    }

    /// Returns the number of failed batches kept for retry.
    pub fn retry_batches(&self) -> usize {
        self.values.retry_batches
    }

    /// Returns the explicit autorun setting.
    pub fn autorun(&self) -> Option<bool> {
        self.values.autorun
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }
}
