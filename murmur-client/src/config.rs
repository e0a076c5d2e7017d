//! Client-side configuration loading
//!
//! Loads engine tunables from `~/.config/murmur/config.toml`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use murmur_utils::{MurmurError, Result};

use crate::history::DEFAULT_PAGE_SIZE;
use crate::search::DEFAULT_SEARCH_LIMIT;
use crate::sections::DEFAULT_DEBOUNCE_MS;

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub timeline: TimelineConfig,
    pub search: SearchConfig,
    pub session: SessionConfig,
    pub events: EventsConfig,
}

/// Section grouping and history paging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Max gap between two events of one section (default: 60000)
    pub debounce_ms: u64,
    /// Events per backward page (default: 15)
    pub page_size: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Context events requested before and after each hit (default: 15)
    pub limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Join every invited room after connecting (default: true)
    pub auto_join_invites: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_join_invites: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Capacity of the event notification channel (default: 1024)
    pub buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { buffer: 1024 }
    }
}

impl ClientConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| MurmurError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeline.page_size == 0 {
            return Err(MurmurError::config("timeline.page_size must be at least 1"));
        }
        if self.search.limit == 0 {
            return Err(MurmurError::config("search.limit must be at least 1"));
        }
        if self.events.buffer == 0 {
            return Err(MurmurError::config("events.buffer must be at least 1"));
        }
        Ok(())
    }
}

/// Load configuration from an explicit path
pub fn load_config_from(path: &Path) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path)?;
    ClientConfig::from_toml_str(&content).map_err(|e| MurmurError::ConfigInvalid {
        path: path.to_path_buf(),
        message: match e {
            MurmurError::Config(message) => message,
            other => other.to_string(),
        },
    })
}

/// Load configuration from the default config file
///
/// Returns defaults if the file doesn't exist or can't be parsed.
pub fn load_config() -> ClientConfig {
    let path = murmur_utils::config_file();

    if !path.exists() {
        tracing::debug!("Config file not found, using defaults");
        return ClientConfig::default();
    }

    match load_config_from(&path) {
        Ok(config) => {
            tracing::debug!(
                "Loaded config: debounce_ms={}, page_size={}, search_limit={}, auto_join={}",
                config.timeline.debounce_ms,
                config.timeline.page_size,
                config.search.limit,
                config.session.auto_join_invites
            );
            config
        }
        Err(e) => {
            tracing::warn!("Failed to load config file: {}, using defaults", e);
            ClientConfig::default()
        }
    }
}
