//! Runtime settings: timer durations, limits and rating thresholds.

use std::{env, fs, io::ErrorKind, path::PathBuf};

use serde::Deserialize;
use time::Duration;
use tracing::{info, warn};

/// Default location on disk where the service looks for the JSON settings.
const DEFAULT_CONFIG_PATH: &str = "config/match-ledger.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "MATCH_LEDGER_CONFIG_PATH";

/// Immutable runtime settings shared across the application.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Time allowed for result collection once started.
    pub submit_timeout_minutes: u32,
    /// How long before the forced-fail timeout players are reminded.
    pub warning_offset_minutes: u32,
    /// Time before a submitted result is accepted automatically.
    pub accept_timeout_minutes: u32,
    /// Resubmissions allowed before a match fails.
    pub resubmits_limit: u32,
    /// Minimum matches in a month to appear in the standings.
    pub monthly_matches_threshold: u32,
    /// Fixed step added to the remaining deadline on resubmit.
    pub resubmit_extension_minutes: u32,
    /// Delay between assembly and the start notification.
    pub assembled_notification_delay_seconds: u32,
    /// Timer callbacks allowed to run at once.
    pub timer_workers: usize,
    /// Period of the rating merge.
    pub rating_merge_interval_minutes: u32,
}

impl Settings {
    /// Load settings from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
                Ok(settings) => {
                    info!(path = %path.display(), "loaded settings from config");
                    settings
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Time players have to submit results once collection starts.
    pub fn submit_timeout(&self) -> Duration {
        Duration::minutes(self.submit_timeout_minutes.into())
    }

    /// How long before the forced-fail deadline the warning goes out.
    pub fn warning_offset(&self) -> Duration {
        Duration::minutes(self.warning_offset_minutes.into())
    }

    /// Time left to the others once a submission is complete.
    pub fn accept_timeout(&self) -> Duration {
        Duration::minutes(self.accept_timeout_minutes.into())
    }

    /// Step added to a pending deadline on resubmit.
    pub fn resubmit_extension(&self) -> Duration {
        Duration::minutes(self.resubmit_extension_minutes.into())
    }

    /// Pause between assembly and the session-assembled notice.
    pub fn assembled_notification_delay(&self) -> Duration {
        Duration::seconds(self.assembled_notification_delay_seconds.into())
    }

    /// Period of the background rating merge.
    pub fn rating_merge_interval(&self) -> Duration {
        Duration::minutes(self.rating_merge_interval_minutes.into())
    }

    /// Worker pool size; never zero.
    pub fn timer_workers(&self) -> usize {
        self.timer_workers.max(1)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            submit_timeout_minutes: 60,
            warning_offset_minutes: 15,
            accept_timeout_minutes: 30,
            resubmits_limit: 3,
            monthly_matches_threshold: 5,
            resubmit_extension_minutes: 10,
            assembled_notification_delay_seconds: 30,
            timer_workers: 4,
            rating_merge_interval_minutes: 60,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_keep_their_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "resubmitsLimit": 1, "timerWorkers": 0 }"#).unwrap();
        assert_eq!(settings.resubmits_limit, 1);
        assert_eq!(settings.submit_timeout(), Duration::hours(1));
        assert_eq!(settings.warning_offset(), Duration::minutes(15));
        assert_eq!(settings.timer_workers(), 1);
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.accept_timeout(), Duration::minutes(30));
        assert_eq!(settings.resubmit_extension(), Duration::minutes(10));
        assert_eq!(settings.assembled_notification_delay(), Duration::seconds(30));
        assert_eq!(settings.rating_merge_interval(), Duration::hours(1));
        assert_eq!(settings.monthly_matches_threshold, 5);
    }
}
