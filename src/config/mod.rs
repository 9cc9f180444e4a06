//! Configuration management for the event chain.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support (`CONFIG_PATH`)
//! - Environment variable overrides (`EVENT_CHAIN__SECTION__FIELD`)
//! - Component-wise validation
mod archive;
mod flow;
mod lock;
mod monitoring;
mod resource;
mod retry;
mod storage;
mod watch;
pub use archive::*;
pub use flow::*;
pub use lock::*;
pub use monitoring::*;
pub use resource::*;
pub use retry::*;
pub use storage::*;
pub use watch::*;


use std::env;
use std::fmt::Debug;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

const ENV_PREFIX: &str = "EVENT_CHAIN";

/// Main configuration container for ingestion flows and watch serving
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct EventChainConfig {
    /// Ingestion batch and loop parameters
    #[serde(default)]
    pub flow: FlowConfig,
    /// Long-poll parameters of watch serving
    #[serde(default)]
    pub watch: WatchConfig,
    /// Retry policies for batch commits and lock acquisition
    #[serde(default)]
    pub retry: RetryPolicies,
    /// Sequence lock used by mix flows
    #[serde(default)]
    pub lock: LockConfig,
    /// Delete archive retention
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Per-resource chain retention
    #[serde(default)]
    pub resource: ResourceConfig,
    /// Embedded store location
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metrics endpoint
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Debug for EventChainConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EventChainConfig")
            .field("flow", &self.flow)
            .field("watch", &self.watch)
            .field("resource", &self.resource)
            .finish()
    }
}

impl EventChainConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Configuration sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults (lowest priority)
    /// 2. Configuration file from `CONFIG_PATH` environment variable (if set)
    /// 3. Environment variables with `EVENT_CHAIN__` prefix (highest priority)
    ///
    /// # Note
    /// Callers MUST call `validate()` once all overrides are applied.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("EVENT_CHAIN__WATCH__TIMEOUT_MS", "5000");
    /// let cfg = EventChainConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Environment variables still take precedence over the file.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.flow.validate()?;
        self.watch.validate()?;
        self.retry.validate()?;
        self.lock.validate()?;
        self.archive.validate()?;
        self.resource.validate()?;
        self.monitoring.validate()?;
        Ok(self)
    }
}

pub(super) fn invalid(msg: String) -> Error {
    Error::Config(ConfigError::Message(msg))
}
