use crate::gbis;
use crate::supervisor::{CollectorSettings, DEFAULT_RECONCILE_INTERVAL};
use crate::tracker::TrackerPolicy;
use crate::window::TimeWindow;
use crate::worker::WorkerSettings;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{field} must be between 0 and 23, got {value}")]
    HourOutOfRange { field: &'static str, value: u32 },

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: i64 },

    #[error("unknown time zone {0:?}")]
    UnknownTimezone(String),
}

/// Settings file contents. Every field is optional in the file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub service_key: String,
    pub api_base_url: String,
    pub start_hour: u32,
    pub end_hour: u32,
    pub interval_ms: u64,
    pub timezone: String,
    pub port: u16,
    pub reconcile_interval_secs: u64,
    pub confirmation_timeout_secs: i64,
    pub retention_secs: i64,
    pub max_age_secs: i64,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            service_key: String::new(),
            api_base_url: gbis::DEFAULT_BASE_URL.to_string(),
            start_hour: 0,
            end_hour: 0,
            interval_ms: DEFAULT_INTERVAL_MS,
            timezone: "Asia/Seoul".to_string(),
            port: 3000,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL.as_secs(),
            confirmation_timeout_secs: 120,
            retention_secs: 600,
            max_age_secs: 3600,
            request_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Reads the settings file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn timezone(&self) -> Result<Tz, SettingsError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| SettingsError::UnknownTimezone(self.timezone.clone()))
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        for (field, value) in [("start_hour", self.start_hour), ("end_hour", self.end_hour)] {
            if value > 23 {
                return Err(SettingsError::HourOutOfRange { field, value });
            }
        }
        for (field, value) in [
            ("confirmation_timeout_secs", self.confirmation_timeout_secs),
            ("retention_secs", self.retention_secs),
            ("max_age_secs", self.max_age_secs),
        ] {
            if value <= 0 {
                return Err(SettingsError::NonPositive { field, value });
            }
        }
        self.timezone()?;
        Ok(())
    }

    pub fn collector(&self) -> Result<CollectorSettings, SettingsError> {
        self.validate()?;
        let interval_ms = if self.interval_ms == 0 {
            DEFAULT_INTERVAL_MS
        } else {
            self.interval_ms
        };

        Ok(CollectorSettings {
            worker: WorkerSettings {
                interval: Duration::from_millis(interval_ms),
                window: TimeWindow::new(self.start_hour, self.end_hour),
                timezone: self.timezone()?,
            },
            policy: TrackerPolicy {
                confirmation_timeout: chrono::Duration::seconds(self.confirmation_timeout_secs),
                retention: chrono::Duration::seconds(self.retention_secs),
                max_age: chrono::Duration::seconds(self.max_age_secs),
            },
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.json")).unwrap();

        let collector = settings.collector().unwrap();
        assert_eq!(collector.worker.interval, Duration::from_secs(30));
        assert!(collector.worker.window.is_all_day());
        assert_eq!(collector.worker.timezone, chrono_tz::Asia::Seoul);
        assert_eq!(collector.policy.confirmation_timeout, chrono::Duration::minutes(2));
        assert_eq!(collector.policy.retention, chrono::Duration::minutes(10));
        assert_eq!(collector.policy.max_age, chrono::Duration::hours(1));
        assert_eq!(collector.reconcile_interval, Duration::from_secs(30));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"start_hour": 22, "end_hour": 2, "interval_ms": 0}"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.start_hour, 22);
        assert_eq!(settings.port, 3000);

        let collector = settings.collector().unwrap();
        assert_eq!(collector.worker.window, TimeWindow::new(22, 2));
        assert_eq!(collector.worker.interval, Duration::from_millis(DEFAULT_INTERVAL_MS));
    }

    #[test]
    fn rejects_bad_hour_and_zone() {
        let settings = Settings {
            end_hour: 24,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::HourOutOfRange { field: "end_hour", value: 24 })
        ));

        let settings = Settings {
            timezone: "Mars/Olympus".to_string(),
            ..Settings::default()
        };
        assert!(matches!(settings.collector(), Err(SettingsError::UnknownTimezone(_))));
    }

    #[test]
    fn rejects_non_positive_durations() {
        let settings = Settings {
            retention_secs: 0,
            ..Settings::default()
        };
        assert!(matches!(
            settings.collector(),
            Err(SettingsError::NonPositive { field: "retention_secs", value: 0 })
        ));

        let settings = Settings {
            max_age_secs: -5,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::NonPositive { field: "max_age_secs", value: -5 })
        ));
    }
}
