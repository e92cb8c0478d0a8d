//! Configuration loading and validation.
//!
//! The configuration is stored in TOML format and defines:
//! - Where the event tables live (`database_url`)
//! - Where the admin console listens (`admin_bind`)
//! - One `[[processors]]` entry per processor instance

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use eventproc_core::{ProcessorError, ProcessorResult};
use eventproc_observability::LogFormat;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "EVENTPROC_CONFIG";
/// Overrides `database_url`.
pub const DATABASE_URL_ENV: &str = "EVENTPROC_DATABASE_URL";
/// Overrides `admin_bind`.
pub const ADMIN_BIND_ENV: &str = "EVENTPROC_ADMIN_BIND";

/// Settings of one processor instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Instance name; also the table prefix.
    pub name: String,

    /// Delay before the worker's first cycle.
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,

    /// Base inter-cycle sleep.
    #[serde(default = "default_base_sleep_ms")]
    pub base_sleep_ms: u64,

    /// Added to the sleep once per live processor instance in the process.
    #[serde(default = "default_per_instance_overhead_ms")]
    pub per_instance_overhead_ms: u64,

    /// Upper bound on one wait for work.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Pending inserts above this count go out as one multi-row INSERT.
    #[serde(default = "default_batch_insert_threshold")]
    pub batch_insert_threshold: usize,

    /// Whether the worker starts in active mode.
    #[serde(default = "default_active")]
    pub active: bool,
}

const fn default_warmup_ms() -> u64 {
    1000
}

const fn default_base_sleep_ms() -> u64 {
    50
}

const fn default_per_instance_overhead_ms() -> u64 {
    5
}

const fn default_idle_poll_ms() -> u64 {
    1000
}

const fn default_batch_insert_threshold() -> usize {
    16
}

const fn default_active() -> bool {
    true
}

impl ProcessorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            warmup_ms: default_warmup_ms(),
            base_sleep_ms: default_base_sleep_ms(),
            per_instance_overhead_ms: default_per_instance_overhead_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            batch_insert_threshold: default_batch_insert_threshold(),
            active: default_active(),
        }
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup_ms = warmup.as_millis() as u64;
        self
    }

    pub fn with_base_sleep(mut self, base: Duration) -> Self {
        self.base_sleep_ms = base.as_millis() as u64;
        self
    }

    pub fn with_per_instance_overhead(mut self, overhead: Duration) -> Self {
        self.per_instance_overhead_ms = overhead.as_millis() as u64;
        self
    }

    pub fn with_idle_poll(mut self, poll: Duration) -> Self {
        self.idle_poll_ms = poll.as_millis() as u64;
        self
    }

    pub fn with_batch_insert_threshold(mut self, threshold: usize) -> Self {
        self.batch_insert_threshold = threshold;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn base_sleep(&self) -> Duration {
        Duration::from_millis(self.base_sleep_ms)
    }

    pub fn per_instance_overhead(&self) -> Duration {
        Duration::from_millis(self.per_instance_overhead_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }

    /// Names become table names, so only `[A-Za-z][A-Za-z0-9_]*` is accepted.
    pub fn validate(&self) -> ProcessorResult<()> {
        let mut chars = self.name.chars();
        let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(ProcessorError::invalid_config(format!(
                "processor name '{}' must match [A-Za-z][A-Za-z0-9_]*",
                self.name
            )));
        }
        if self.idle_poll_ms == 0 {
            return Err(ProcessorError::invalid_config(format!(
                "{}: idle_poll_ms must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Process-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
}

fn default_database_url() -> String {
    "sqlite://eventproc.db?mode=rwc".to_string()
}

fn default_admin_bind() -> String {
    "127.0.0.1:8089".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            admin_bind: default_admin_bind(),
            log_format: LogFormat::default(),
            processors: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ProcessorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProcessorError::invalid_config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> ProcessorResult<Self> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| ProcessorError::invalid_config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `EVENTPROC_CONFIG` (defaults when unset), then apply the
    /// `EVENTPROC_DATABASE_URL` / `EVENTPROC_ADMIN_BIND` overrides.
    pub fn from_env() -> ProcessorResult<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            config.database_url = url;
        }
        if let Ok(bind) = std::env::var(ADMIN_BIND_ENV) {
            config.admin_bind = bind;
        }
        Ok(config)
    }

    pub fn validate(&self) -> ProcessorResult<()> {
        let mut seen = std::collections::HashSet::new();
        for processor in &self.processors {
            processor.validate()?;
            if !seen.insert(processor.name.as_str()) {
                return Err(ProcessorError::invalid_config(format!(
                    "duplicate processor name '{}'",
                    processor.name
                )));
            }
        }
        Ok(())
    }
}
