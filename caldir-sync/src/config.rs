//! Sync engine configuration.
//!
//! Loaded from `~/.config/caldir/sync.toml` (optional) with
//! `CALDIR_SYNC_*` environment overrides, e.g.
//! `CALDIR_SYNC_PAGE_TIMEOUT=10s` or `CALDIR_SYNC_TIMELINE__MAX_LOOKAHEAD=2y`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_FULL_SYNC_LOOKBACK_DAYS, DEFAULT_INITIAL_LOOKAHEAD_DAYS,
    DEFAULT_MAX_FULL_SYNC_RESTARTS, DEFAULT_MAX_LOOKAHEAD_DAYS,
    DEFAULT_MAX_OCCURRENCES_PER_MASTER, DEFAULT_PAGE_TIMEOUT, MAX_CONFIGURED_SPAN_DAYS,
};
use crate::error::{ConfigError, ConfigResult};

const CONFIG_FILE: &str = "sync.toml";
const ENV_PREFIX: &str = "CALDIR_SYNC";

const DAY: u64 = 24 * 60 * 60;

/// Durations are written in humantime syntax ("30s", "7days").
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

fn default_page_timeout() -> Duration {
    DEFAULT_PAGE_TIMEOUT
}

fn default_lookback_days() -> i64 {
    DEFAULT_FULL_SYNC_LOOKBACK_DAYS
}

fn default_max_restarts() -> u32 {
    DEFAULT_MAX_FULL_SYNC_RESTARTS
}

fn default_initial_lookahead() -> Duration {
    Duration::from_secs(DEFAULT_INITIAL_LOOKAHEAD_DAYS * DAY)
}

fn default_max_lookahead() -> Duration {
    Duration::from_secs(DEFAULT_MAX_LOOKAHEAD_DAYS * DAY)
}

fn default_max_occurrences() -> u16 {
    DEFAULT_MAX_OCCURRENCES_PER_MASTER
}

/// Bounds for recurrence expansion in timeline queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// First window searched by `next_occurrence`.
    #[serde(default = "default_initial_lookahead", with = "duration_str")]
    pub initial_lookahead: Duration,

    /// The search window doubles up to this span, then gives up.
    #[serde(default = "default_max_lookahead", with = "duration_str")]
    pub max_lookahead: Duration,

    #[serde(default = "default_max_occurrences")]
    pub max_occurrences_per_master: u16,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        TimelineConfig {
            initial_lookahead: default_initial_lookahead(),
            max_lookahead: default_max_lookahead(),
            max_occurrences_per_master: default_max_occurrences(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upper bound on a single page fetch.
    #[serde(default = "default_page_timeout", with = "duration_str")]
    pub page_timeout: Duration,

    /// Full syncs only ask for events ending after `now - lookback`.
    #[serde(default = "default_lookback_days")]
    pub full_sync_lookback_days: i64,

    /// How often one run may restart as a full sync after a rejected token.
    #[serde(default = "default_max_restarts")]
    pub max_full_sync_restarts: u32,

    /// Snapshot directory for the local store. In-memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,

    #[serde(default)]
    pub timeline: TimelineConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            page_timeout: default_page_timeout(),
            full_sync_lookback_days: default_lookback_days(),
            max_full_sync_restarts: default_max_restarts(),
            store_dir: None,
            timeline: TimelineConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn config_path() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".into()))?
            .join("caldir");

        Ok(config_dir.join(CONFIG_FILE))
    }

    /// Load from the default location.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path` (which may not exist) layered with environment overrides.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        let config: SyncConfig = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.page_timeout.is_zero() {
            return Err(ConfigError::Invalid("page_timeout must be positive".into()));
        }
        if self.full_sync_lookback_days < 0 {
            return Err(ConfigError::Invalid(
                "full_sync_lookback_days must not be negative".into(),
            ));
        }
        if self.full_sync_lookback_days as u64 > MAX_CONFIGURED_SPAN_DAYS {
            return Err(ConfigError::Invalid(format!(
                "full_sync_lookback_days must be at most {MAX_CONFIGURED_SPAN_DAYS}"
            )));
        }
        if self.timeline.initial_lookahead.is_zero() {
            return Err(ConfigError::Invalid(
                "timeline.initial_lookahead must be positive".into(),
            ));
        }
        if self.timeline.max_lookahead < self.timeline.initial_lookahead {
            return Err(ConfigError::Invalid(
                "timeline.max_lookahead must be at least initial_lookahead".into(),
            ));
        }
        if self.timeline.max_lookahead > Duration::from_secs(MAX_CONFIGURED_SPAN_DAYS * DAY) {
            return Err(ConfigError::Invalid(format!(
                "timeline.max_lookahead must be at most {MAX_CONFIGURED_SPAN_DAYS} days"
            )));
        }
        if self.timeline.max_occurrences_per_master == 0 {
            return Err(ConfigError::Invalid(
                "timeline.max_occurrences_per_master must be positive".into(),
            ));
        }
        Ok(())
    }

    /// `store_dir` with `~` expanded.
    pub fn expanded_store_dir(&self) -> Option<PathBuf> {
        self.store_dir.as_ref().map(|dir| {
            let full_path_str = shellexpand::tilde(&dir.to_string_lossy()).into_owned();
            PathBuf::from(full_path_str)
        })
    }

    /// Clamped to the validated range so unchecked configs cannot overflow.
    pub fn full_sync_lookback(&self) -> chrono::Duration {
        let days = self
            .full_sync_lookback_days
            .clamp(0, MAX_CONFIGURED_SPAN_DAYS as i64);
        chrono::Duration::days(days)
    }

    /// Write the config to `path`, creating the parent directory.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.page_timeout, Duration::from_secs(30));
        assert_eq!(config.timeline.initial_lookahead, Duration::from_secs(7 * DAY));
    }

    #[test]
    fn reads_humantime_durations_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(
            &path,
            concat!(
                "page_timeout = \"5s\"\n",
                "store_dir = \"~/calendar/.sync\"\n\n",
                "[timeline]\n",
                "max_lookahead = \"30days\"\n",
            ),
        )
        .unwrap();

        let config = SyncConfig::load_from(&path).unwrap();
        assert_eq!(config.page_timeout, Duration::from_secs(5));
        assert_eq!(config.timeline.max_lookahead, Duration::from_secs(30 * DAY));
        assert_eq!(config.full_sync_lookback_days, 28);
        let expanded = config.expanded_store_dir().unwrap();
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");
        let config = SyncConfig {
            page_timeout: Duration::from_secs(12),
            max_full_sync_restarts: 3,
            ..SyncConfig::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(SyncConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn rejects_inverted_lookahead() {
        let config = SyncConfig {
            timeline: TimelineConfig {
                initial_lookahead: Duration::from_secs(10 * DAY),
                max_lookahead: Duration::from_secs(DAY),
                ..TimelineConfig::default()
            },
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_lookback_beyond_a_century() {
        let config = SyncConfig {
            full_sync_lookback_days: i64::MAX,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(
            config.full_sync_lookback(),
            chrono::Duration::days(MAX_CONFIGURED_SPAN_DAYS as i64)
        );

        let config = SyncConfig {
            full_sync_lookback_days: MAX_CONFIGURED_SPAN_DAYS as i64,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unbounded_lookahead() {
        let config = SyncConfig {
            timeline: TimelineConfig {
                max_lookahead: Duration::MAX,
                ..TimelineConfig::default()
            },
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
