//! Engine configuration.
//!
//! `EngineConfig` is the JSON file an application ships with; `SyncConfig`
//! is the runtime projection the sync engine consumes. Credentials are never
//! part of either.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::{ConflictStrategy, RetryPolicy};
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// File-provisioned engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub attachments_dir: Option<PathBuf>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Record type to API base path, e.g. `visit -> /field-sales/visits`
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    /// Types downloaded on a full sync; defaults to every mapped type
    #[serde(default)]
    pub tracked_types: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub auto_sync_interval_secs: Option<u64>,
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            attachments_dir: None,
            api_base_url: None,
            endpoints: BTreeMap::new(),
            tracked_types: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            conflict_strategy: ConflictStrategy::default(),
            auto_sync_interval_secs: None,
        }
    }
}

impl EngineConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let payload = std::fs::read_to_string(path)?;
        let config = Self::parse(&payload).map_err(|error| match error {
            Error::InvalidInput(message) => {
                Error::InvalidInput(format!("{}: {message}", path.display()))
            }
            other => other,
        })?;
        tracing::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a JSON config payload.
    pub fn parse(payload: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(payload)
            .map_err(|error| Error::InvalidInput(format!("invalid config JSON: {error}")))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.api_base_url = normalize_text_option(self.api_base_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.tracked_types = self
            .tracked_types
            .iter()
            .map(|item_type| item_type.trim().to_string())
            .filter(|item_type| !item_type.is_empty())
            .collect();
    }

    /// Check field values.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.api_base_url {
            if !is_http_url(url) {
                return Err(Error::InvalidInput(
                    "config field 'api_base_url' must include http:// or https://".to_string(),
                ));
            }
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput(
                "config field 'batch_size' must be greater than zero".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidInput(
                "config field 'max_retries' must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "config field 'request_timeout_secs' must be greater than zero".to_string(),
            ));
        }
        if let Some(item_type) = self
            .tracked_types
            .iter()
            .find(|item_type| !self.endpoints.contains_key(*item_type))
        {
            return Err(Error::InvalidInput(format!(
                "tracked type '{item_type}' has no endpoint"
            )));
        }
        Ok(())
    }

    /// Overlay `FIELDSYNC_*` variables from `lookup` onto this config.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| normalize_text_option(lookup(name));

        if let Some(path) = var("FIELDSYNC_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = var("FIELDSYNC_ATTACHMENTS_DIR") {
            self.attachments_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = var("FIELDSYNC_API_URL") {
            self.api_base_url = Some(url);
        }
        if let Some(size) = var("FIELDSYNC_BATCH_SIZE") {
            self.batch_size = parse_number("FIELDSYNC_BATCH_SIZE", &size)?;
        }
        if let Some(retries) = var("FIELDSYNC_MAX_RETRIES") {
            self.max_retries = parse_number("FIELDSYNC_MAX_RETRIES", &retries)?;
        }
        if let Some(secs) = var("FIELDSYNC_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_number("FIELDSYNC_TIMEOUT_SECS", &secs)?;
        }
        if let Some(strategy) = var("FIELDSYNC_CONFLICT_STRATEGY") {
            self.conflict_strategy = strategy.parse()?;
        }

        self.normalize();
        self.validate()
    }

    /// Runtime settings for the sync engine.
    pub fn sync_config(&self) -> SyncConfig {
        let tracked_types = if self.tracked_types.is_empty() {
            self.endpoints.keys().cloned().collect()
        } else {
            self.tracked_types.clone()
        };
        SyncConfig {
            tracked_types,
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            conflict_strategy: self.conflict_strategy,
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::InvalidInput(format!("{name} must be a number, got '{raw}'")))
}

/// Settings the sync engine runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Types downloaded on a full sync
    pub tracked_types: Vec<String>,
    pub batch_size: usize,
    /// Attempts per item and pass
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
    pub conflict_strategy: ConflictStrategy,
}

impl SyncConfig {
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        EngineConfig::default().sync_config()
    }
}
