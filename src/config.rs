//! Configuration file support for water-temp.
//!
//! Loads settings from `~/.config/water-temp/config.toml` on Linux
//! (or platform-appropriate location on other OSes).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordinator::{
    CoordinatorSettings, DEFAULT_MAX_REFRESH_DELAY, DEFAULT_MIN_REFRESH_SPACING,
};
use crate::live::{self, LiveConfig};
use crate::simulated::{self, SimulatedConfig};
use crate::source::DEFAULT_FAILURE_BACKOFF;

/// Deserialize a human-readable duration string like "5m" into a `Duration`.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a human-readable duration.
///
/// Supports: ms, s, m, h (case-insensitive); a bare number means seconds.
/// Examples: "30", "500ms", "90s", "5m", "1.5h"
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let s_lower = s.to_ascii_lowercase();

    let num_end = s_lower
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s_lower.len());

    let (num_str, unit) = s_lower.split_at(num_end);
    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {}", s))?;

    let seconds = match unit.trim() {
        "ms" => num / 1000.0,
        "" | "s" | "sec" => num,
        "m" | "min" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("unknown duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {}: {}", s, e))
}

/// One configured data source.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Live {
        #[serde(default = "default_live_name")]
        name: String,

        #[serde(default = "default_live_url")]
        url: String,

        #[serde(default = "default_live_interval", deserialize_with = "deserialize_duration")]
        interval: Duration,

        #[serde(default = "default_utc_offset_hours")]
        utc_offset_hours: i64,

        #[serde(default = "default_request_timeout", deserialize_with = "deserialize_duration")]
        request_timeout: Duration,
    },
    Simulated {
        #[serde(default = "default_simulated_name")]
        name: String,

        #[serde(default = "default_simulated_interval", deserialize_with = "deserialize_duration")]
        interval: Duration,

        #[serde(default)]
        inject_faults: bool,
    },
}

fn default_live_name() -> String {
    live::DEFAULT_NAME.to_string()
}

fn default_live_url() -> String {
    live::DEFAULT_URL.to_string()
}

fn default_live_interval() -> Duration {
    live::DEFAULT_INTERVAL
}

fn default_utc_offset_hours() -> i64 {
    live::DEFAULT_UTC_OFFSET_HOURS
}

fn default_request_timeout() -> Duration {
    live::DEFAULT_REQUEST_TIMEOUT
}

fn default_simulated_name() -> String {
    simulated::DEFAULT_NAME.to_string()
}

fn default_simulated_interval() -> Duration {
    simulated::DEFAULT_INTERVAL
}

impl SourceConfig {
    pub fn live() -> Self {
        SourceConfig::Live {
            name: default_live_name(),
            url: default_live_url(),
            interval: default_live_interval(),
            utc_offset_hours: default_utc_offset_hours(),
            request_timeout: default_request_timeout(),
        }
    }

    pub fn simulated() -> Self {
        SourceConfig::Simulated {
            name: default_simulated_name(),
            interval: default_simulated_interval(),
            inject_faults: false,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SourceConfig::Live { name, .. } | SourceConfig::Simulated { name, .. } => name,
        }
    }
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Station shown when no last viewed station is stored.
    pub station: String,

    /// Site of the default station.
    pub site: String,

    /// Delay before a failed source fetches again.
    #[serde(deserialize_with = "deserialize_duration")]
    pub failure_backoff: Duration,

    /// Minimum spacing between two refresh cycles.
    #[serde(deserialize_with = "deserialize_duration")]
    pub min_refresh_spacing: Duration,

    /// Latest the next refresh cycle is scheduled.
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_refresh_delay: Duration,

    /// Print statistics at this interval (0 disables).
    #[serde(deserialize_with = "deserialize_duration")]
    pub stats_interval: Duration,

    /// Configured sources, in display order.
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            station: "Strobl".to_string(),
            site: "Wolfgangsee".to_string(),
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            min_refresh_spacing: DEFAULT_MIN_REFRESH_SPACING,
            max_refresh_delay: DEFAULT_MAX_REFRESH_DELAY,
            stats_interval: Duration::ZERO,
            sources: vec![SourceConfig::live()],
        }
    }
}

impl Config {
    /// Load configuration from the default config file location.
    ///
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but is malformed.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Config::default()),
        }
    }

    /// Load configuration from an explicit path, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in config file: {}", path.display()))
    }

    /// Returns the path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("water-temp/config.toml"))
    }

    /// Validate all configuration settings.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            anyhow::bail!("No sources configured");
        }

        for (i, source) in self.sources.iter().enumerate() {
            if source.name().trim().is_empty() {
                anyhow::bail!("Invalid source [{}]: name must not be empty", i);
            }
            if self.sources[..i].iter().any(|s| s.name() == source.name()) {
                anyhow::bail!("Invalid source [{}]: duplicate name \"{}\"", i, source.name());
            }
            if let SourceConfig::Live { url, utc_offset_hours, .. } = source {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    anyhow::bail!("Invalid source [{}]: unsupported URL {}", i, url);
                }
                if !(-12..=14).contains(utc_offset_hours) {
                    anyhow::bail!(
                        "Invalid source [{}]: UTC offset {} out of range",
                        i,
                        utc_offset_hours
                    );
                }
            }
        }

        if self.min_refresh_spacing > self.max_refresh_delay {
            anyhow::bail!("min_refresh_spacing must not exceed max_refresh_delay");
        }

        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            max_refresh_delay: self.max_refresh_delay,
            min_refresh_spacing: self.min_refresh_spacing,
            failure_backoff: self.failure_backoff,
        }
    }

    /// Settings for a live source entry, with the global failure backoff.
    pub fn live_config(&self, source: &SourceConfig) -> Option<LiveConfig> {
        match source {
            SourceConfig::Live {
                name,
                url,
                interval,
                utc_offset_hours,
                request_timeout,
            } => Some(LiveConfig {
                name: name.clone(),
                url: url.clone(),
                interval: *interval,
                utc_offset_hours: *utc_offset_hours,
                request_timeout: *request_timeout,
                failure_backoff: self.failure_backoff,
                ..LiveConfig::default()
            }),
            SourceConfig::Simulated { .. } => None,
        }
    }

    /// Settings for a simulated source entry, with the global failure backoff.
    pub fn simulated_config(&self, source: &SourceConfig) -> Option<SimulatedConfig> {
        match source {
            SourceConfig::Simulated {
                name,
                interval,
                inject_faults,
            } => Some(SimulatedConfig {
                name: name.clone(),
                interval: *interval,
                inject_faults: *inject_faults,
                failure_backoff: self.failure_backoff,
            }),
            SourceConfig::Live { .. } => None,
        }
    }
}
