//! Pipeline configuration, builders, and INI loading.
//!
//! Configuration is plain data with [`Default`] values matching the
//! collector's expectations. [`PipelineConfigBuilder`] validates values the
//! way the other builders do and reports [`ConfigError::Invalid`].
//!
//! The INI format uses these sections, all optional:
//!
//! ```ini
//! [pipeline]
//! queue_capacity = 1024
//! max_log_size = 262144
//! warn_interval_ms = 5000
//! storage_path = /var/lib/app/logs
//! persistence_capacity = 300
//!
//! [ingestion]
//! log_url = https://in.appcenter.ms
//! connect_timeout_ms = 10000
//! request_timeout_ms = 60000
//! workers = 3
//! capacity = 64
//!
//! [retry]
//! base_ms = 10000
//! cap_ms = 1200000
//! max_retries = 3
//! jitter = equal
//!
//! [group.analytics]
//! batch_count_threshold = 50
//! batch_interval_ms = 3000
//! max_parallel_batches = 3
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};

use crate::channel::GroupConfig;
use crate::dispatch::DEFAULT_QUEUE_CAPACITY;
use crate::error::ConfigError;
use crate::ingestion::{HttpIngestionConfig, Jitter, RetryPolicy};
use crate::log_record::DEFAULT_MAX_LOG_SIZE;
use crate::persistence::DEFAULT_CAPACITY;
use crate::rate_limited_warner::DEFAULT_WARN_INTERVAL;

const GROUP_SECTION_PREFIX: &str = "group.";

macro_rules! ensure_positive {
    ($value:expr, $field:expr) => {{
        if $value == 0 {
            Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                $field
            )))
        } else {
            Ok($value)
        }
    }};
}

macro_rules! option_setter {
    ($(#[$meta:meta])* $fn_name:ident, $field:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $fn_name(mut self, value: $ty) -> Self {
            self.$field = Some(value);
            self
        }
    };
}

/// A group declared in configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupDefinition {
    pub name: String,
    pub config: GroupConfig,
}

/// Complete pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Bounded dispatcher queue capacity.
    pub queue_capacity: usize,
    /// Largest accepted serialized log, in bytes.
    pub max_log_size: usize,
    /// Minimum spacing of repeated drop warnings.
    pub warn_interval: Duration,
    /// Directory for durable storage; `None` keeps logs in memory.
    pub storage_path: Option<PathBuf>,
    /// Logs kept per group before the oldest are evicted.
    pub persistence_capacity: usize,
    pub ingestion: HttpIngestionConfig,
    pub retry: RetryPolicy,
    pub groups: Vec<GroupDefinition>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            warn_interval: DEFAULT_WARN_INTERVAL,
            storage_path: None,
            persistence_capacity: DEFAULT_CAPACITY,
            ingestion: HttpIngestionConfig::default(),
            retry: RetryPolicy::default(),
            groups: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Check every nested value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive!(self.queue_capacity, "queue_capacity")?;
        ensure_positive!(self.max_log_size, "max_log_size")?;
        ensure_positive!(self.persistence_capacity, "persistence_capacity")?;
        self.ingestion.validate()?;
        self.retry.validate()?;
        for (index, group) in self.groups.iter().enumerate() {
            if group.name.is_empty() {
                return Err(ConfigError::Invalid("group name must not be empty".into()));
            }
            if self.groups[..index].iter().any(|g| g.name == group.name) {
                return Err(ConfigError::Invalid(format!(
                    "group '{}' declared twice",
                    group.name
                )));
            }
            group
                .config
                .validate()
                .map_err(|err| ConfigError::Invalid(format!("group '{}': {err}", group.name)))?;
        }
        Ok(())
    }

    /// Load and validate configuration from an INI file.
    pub fn from_ini_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path).map_err(|err| ConfigError::Load {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Load and validate configuration from INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|err| ConfigError::Load {
            path: "<string>".into(),
            reason: err.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (section, props) in ini.iter() {
            match section {
                None => {
                    if let Some((key, _)) = props.iter().next() {
                        return Err(ConfigError::Invalid(format!(
                            "key '{key}' must be inside a section"
                        )));
                    }
                }
                Some("pipeline") => config.apply_pipeline(props)?,
                Some("ingestion") => apply_ingestion(&mut config.ingestion, props)?,
                Some("retry") => apply_retry(&mut config.retry, props)?,
                Some(name) => match name.strip_prefix(GROUP_SECTION_PREFIX) {
                    Some(group) => config.groups.push(GroupDefinition {
                        name: group.to_owned(),
                        config: group_from_ini(name, props)?,
                    }),
                    None => {
                        return Err(ConfigError::Invalid(format!("unknown section [{name}]")));
                    }
                },
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_pipeline(&mut self, props: &Properties) -> Result<(), ConfigError> {
        for (key, value) in props.iter() {
            match key {
                "queue_capacity" => self.queue_capacity = parse("pipeline", key, value)?,
                "max_log_size" => self.max_log_size = parse("pipeline", key, value)?,
                "warn_interval_ms" => self.warn_interval = millis("pipeline", key, value)?,
                "storage_path" => self.storage_path = Some(PathBuf::from(value)),
                "persistence_capacity" => {
                    self.persistence_capacity = parse("pipeline", key, value)?
                }
                _ => return Err(unknown_key("pipeline", key)),
            }
        }
        Ok(())
    }
}

fn apply_ingestion(config: &mut HttpIngestionConfig, props: &Properties) -> Result<(), ConfigError> {
    for (key, value) in props.iter() {
        match key {
            "log_url" => config.log_url = value.to_owned(),
            "connect_timeout_ms" => config.connect_timeout = millis("ingestion", key, value)?,
            "request_timeout_ms" => config.request_timeout = millis("ingestion", key, value)?,
            "workers" => config.workers = parse("ingestion", key, value)?,
            "capacity" => config.capacity = parse("ingestion", key, value)?,
            _ => return Err(unknown_key("ingestion", key)),
        }
    }
    Ok(())
}

fn apply_retry(policy: &mut RetryPolicy, props: &Properties) -> Result<(), ConfigError> {
    for (key, value) in props.iter() {
        match key {
            "base_ms" => policy.base = millis("retry", key, value)?,
            "cap_ms" => policy.cap = millis("retry", key, value)?,
            "max_retries" => policy.max_retries = parse("retry", key, value)?,
            "jitter" => {
                policy.jitter = match value.trim().to_ascii_lowercase().as_str() {
                    "none" => Jitter::None,
                    "equal" => Jitter::Equal,
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "[retry] jitter must be 'none' or 'equal', got '{other}'"
                        )));
                    }
                }
            }
            _ => return Err(unknown_key("retry", key)),
        }
    }
    Ok(())
}

fn group_from_ini(section: &str, props: &Properties) -> Result<GroupConfig, ConfigError> {
    let mut config = GroupConfig::default();
    for (key, value) in props.iter() {
        match key {
            "batch_count_threshold" => config.batch_count_threshold = parse(section, key, value)?,
            "batch_interval_ms" => config.batch_interval = millis(section, key, value)?,
            "max_parallel_batches" => config.max_parallel_batches = parse(section, key, value)?,
            _ => return Err(unknown_key(section, key)),
        }
    }
    Ok(config)
}

fn parse<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|err| {
        ConfigError::Invalid(format!("[{section}] {key} = '{value}': {err}"))
    })
}

fn millis(section: &str, key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(section, key, value).map(Duration::from_millis)
}

fn unknown_key(section: &str, key: &str) -> ConfigError {
    ConfigError::Invalid(format!("unknown key '{key}' in [{section}]"))
}

/// Fluent builder for [`PipelineConfig`].
#[derive(Clone, Debug, Default)]
pub struct PipelineConfigBuilder {
    queue_capacity: Option<usize>,
    max_log_size: Option<usize>,
    warn_interval: Option<Duration>,
    storage_path: Option<PathBuf>,
    persistence_capacity: Option<usize>,
    ingestion: Option<HttpIngestionConfig>,
    retry: Option<RetryPolicy>,
    groups: Vec<GroupDefinition>,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    option_setter!(
        /// Set the dispatcher queue capacity.
        with_queue_capacity,
        queue_capacity,
        usize
    );
    option_setter!(
        /// Set the maximum serialized log size in bytes.
        with_max_log_size,
        max_log_size,
        usize
    );
    option_setter!(with_warn_interval, warn_interval, Duration);
    option_setter!(
        /// Store logs on disk under this directory.
        with_storage_path,
        storage_path,
        PathBuf
    );
    option_setter!(with_persistence_capacity, persistence_capacity, usize);
    option_setter!(with_ingestion, ingestion, HttpIngestionConfig);
    option_setter!(with_retry, retry, RetryPolicy);

    /// Declare a group started with the pipeline.
    pub fn with_group(mut self, name: impl Into<String>, config: GroupConfig) -> Self {
        self.groups.push(GroupDefinition {
            name: name.into(),
            config,
        });
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let defaults = PipelineConfig::default();
        let config = PipelineConfig {
            queue_capacity: ensure_positive!(
                self.queue_capacity.unwrap_or(defaults.queue_capacity),
                "queue_capacity"
            )?,
            max_log_size: ensure_positive!(
                self.max_log_size.unwrap_or(defaults.max_log_size),
                "max_log_size"
            )?,
            warn_interval: self.warn_interval.unwrap_or(defaults.warn_interval),
            storage_path: self.storage_path,
            persistence_capacity: ensure_positive!(
                self.persistence_capacity
                    .unwrap_or(defaults.persistence_capacity),
                "persistence_capacity"
            )?,
            ingestion: self.ingestion.unwrap_or(defaults.ingestion),
            retry: self.retry.unwrap_or(defaults.retry),
            groups: self.groups,
        };
        config.validate()?;
        Ok(config)
    }
}
