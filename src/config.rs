//! Application configuration loaded from TOML.
//!
//! Every section is optional. Unknown keys are rejected at parse time and
//! out-of-range values by [`AppConfig::validate`].
//!
//! ```toml
//! database_path = "/var/lib/harvester/harvester.db"
//!
//! [harvest]
//! worker_count = 8
//!
//! [search]
//! serve_stale = true
//!
//! [connectors.openalex]
//! mailto = "ops@example.org"
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::db::DatabaseOptions;
use crate::enrich::{EnricherConfig, MIN_CACHE_TTL};
use crate::harvest::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    DEFAULT_WORKER_COUNT, HarvestSettings, RetryPolicy,
};
use crate::http::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_READ_TIMEOUT_SECS, HttpTimeouts};
use crate::search::{AggregatorSettings, ConnectorConfig, DEFAULT_MAX_LIMIT, DEFAULT_WINDOW_PAGES};

/// Connector ids accepted under `[connectors.<id>]`.
pub const KNOWN_CONNECTORS: [&str; 3] = ["local", "crossref", "openalex"];

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Pool size (1..=20).
    pub db_max_connections: u32,
    /// `PRAGMA busy_timeout` in milliseconds (0..=120000).
    pub db_busy_timeout_ms: u32,
    /// Harvest controller tuning.
    pub harvest: HarvestConfig,
    /// Crossref enrichment.
    pub enrichment: EnrichmentConfig,
    /// Federated search.
    pub search: SearchConfig,
    /// Per-connector settings keyed by connector id.
    pub connectors: BTreeMap<String, ConnectorConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let db = DatabaseOptions::default();
        Self {
            database_path: PathBuf::from("harvester.db"),
            db_max_connections: db.max_connections,
            db_busy_timeout_ms: db.busy_timeout_ms,
            harvest: HarvestConfig::default(),
            enrichment: EnrichmentConfig::default(),
            search: SearchConfig::default(),
            connectors: BTreeMap::new(),
        }
    }
}

/// `[harvest]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    pub worker_count: usize,
    pub batch_size: usize,
    pub max_page_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            max_page_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: 1000,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
        }
    }
}

/// `[enrichment]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub mailto: String,
    /// At least one week.
    pub cache_ttl_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            mailto: String::new(),
            cache_ttl_secs: MIN_CACHE_TTL.as_secs(),
        }
    }
}

/// `[search]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub cache_ttl_secs: u64,
    pub serve_stale: bool,
    pub max_limit: u32,
    pub cache_sweep_interval_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            serve_stale: false,
            max_limit: DEFAULT_MAX_LIMIT,
            cache_sweep_interval_secs: 300,
        }
    }
}

impl AppConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed TOML, unknown keys, or out-of-range values.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("Failed to load config file '{}'", path.display()))
    }

    /// Loads `explicit` if given (it must exist), else the default path if a
    /// file is there, else built-in defaults. Returns the file actually read.
    ///
    /// # Errors
    ///
    /// Returns an error if a chosen file cannot be read or is invalid.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        match resolve_default_config_path() {
            Some(path) if path.exists() => Ok((Self::load(&path)?, Some(path))),
            _ => Ok((Self::default(), None)),
        }
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending key and its expected range.
    pub fn validate(&self) -> Result<()> {
        check_range("db_max_connections", u64::from(self.db_max_connections), 1, 20)?;
        check_range("db_busy_timeout_ms", u64::from(self.db_busy_timeout_ms), 0, 120_000)?;

        let h = &self.harvest;
        check_range("harvest.worker_count", h.worker_count as u64, 1, 32)?;
        check_range("harvest.batch_size", h.batch_size as u64, 1, 1000)?;
        check_range("harvest.max_page_attempts", u64::from(h.max_page_attempts), 1, 10)?;
        check_range("harvest.retry_base_delay_ms", h.retry_base_delay_ms, 0, 60_000)?;
        check_range("harvest.connect_timeout_secs", h.connect_timeout_secs, 1, 3600)?;
        check_range("harvest.read_timeout_secs", h.read_timeout_secs, 1, 3600)?;

        if self.enrichment.cache_ttl_secs < MIN_CACHE_TTL.as_secs() {
            bail!(
                "Invalid config value for `enrichment.cache_ttl_secs`: {}. Expected at least {}",
                self.enrichment.cache_ttl_secs,
                MIN_CACHE_TTL.as_secs()
            );
        }

        let s = &self.search;
        check_range("search.cache_ttl_secs", s.cache_ttl_secs, 1, 7 * 24 * 3600)?;
        check_range("search.max_limit", u64::from(s.max_limit), 1, 1000)?;
        check_range("search.cache_sweep_interval_secs", s.cache_sweep_interval_secs, 1, 86_400)?;

        for (id, connector) in &self.connectors {
            if !KNOWN_CONNECTORS.contains(&id.as_str()) {
                bail!(
                    "Unknown connector `{id}` in [connectors]. Expected one of: {}",
                    KNOWN_CONNECTORS.join(", ")
                );
            }
            let key = |field: &str| format!("connectors.{id}.{field}");
            check_range(&key("max_retries"), u64::from(connector.max_retries), 0, 10)?;
            check_range(&key("backoff_ms"), connector.backoff_ms, 0, 60_000)?;
            check_range(&key("rate_limit_ms"), connector.rate_limit_ms, 0, 60_000)?;
            check_range(&key("timeout_secs"), connector.timeout_secs, 1, 3600)?;
        }
        Ok(())
    }

    /// Pool options for the database.
    #[must_use]
    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            max_connections: self.db_max_connections,
            busy_timeout_ms: self.db_busy_timeout_ms,
        }
    }

    /// Timeouts for the OAI-PMH client.
    #[must_use]
    pub fn harvest_timeouts(&self) -> HttpTimeouts {
        HttpTimeouts::from_secs(self.harvest.connect_timeout_secs, self.harvest.read_timeout_secs)
    }

    /// Controller settings.
    #[must_use]
    pub fn harvest_settings(&self) -> HarvestSettings {
        HarvestSettings {
            worker_count: self.harvest.worker_count,
            batch_size: self.harvest.batch_size,
            retry: RetryPolicy::new(
                self.harvest.max_page_attempts,
                Duration::from_millis(self.harvest.retry_base_delay_ms),
                DEFAULT_MAX_DELAY,
                DEFAULT_BACKOFF_MULTIPLIER,
            ),
        }
    }

    /// Enrichment client settings, or `None` when enrichment is off.
    #[must_use]
    pub fn enricher_config(&self) -> Option<EnricherConfig> {
        if !self.enrichment.enabled {
            return None;
        }
        let defaults = EnricherConfig::default();
        Some(EnricherConfig {
            base_url: self.enrichment.base_url.clone().unwrap_or(defaults.base_url),
            mailto: self.enrichment.mailto.clone(),
            cache_ttl: Duration::from_secs(self.enrichment.cache_ttl_secs),
            timeouts: self.harvest_timeouts(),
        })
    }

    /// Aggregator settings.
    #[must_use]
    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            max_limit: self.search.max_limit,
            window_pages: DEFAULT_WINDOW_PAGES,
        }
    }

    /// Settings for connector `id`; defaults when the section is absent.
    #[must_use]
    pub fn connector(&self, id: &str) -> ConnectorConfig {
        self.connectors.get(id).cloned().unwrap_or_default()
    }
}

fn check_range(key: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{key}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/harvester/config.toml`
/// 2. `$HOME/.config/harvester/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("harvester").join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("harvester")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
