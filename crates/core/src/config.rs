use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

/// Business-level age thresholds for the scheduled sweeps. These are
/// not execution deadlines; callers manage their own timeouts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Age after which `process_timeouts` escalates a live request.
    pub timeout_after: Duration,
    /// Age after which `process_reminders` fires `approval.reminder`.
    pub remind_after: Duration,
    /// Age after which `process_expirations` expires a live request.
    pub expire_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_after: Duration::hours(24),
            remind_after: Duration::hours(8),
            expire_after: Duration::days(14),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not parse engine config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid engine config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct SweepsFile {
    #[serde(default)]
    sweeps: SweepsTable,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SweepsTable {
    timeout_hours: i64,
    reminder_hours: i64,
    expire_days: i64,
}

impl Default for SweepsTable {
    fn default() -> Self {
        Self { timeout_hours: 24, reminder_hours: 8, expire_days: 14 }
    }
}

impl EngineConfig {
    /// Parses a `[sweeps]` TOML table:
    ///
    /// ```toml
    /// [sweeps]
    /// timeout_hours = 24
    /// reminder_hours = 8
    /// expire_days = 14
    /// ```
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: SweepsFile = toml::from_str(raw)?;
        let config = Self {
            timeout_after: Duration::hours(file.sweeps.timeout_hours),
            remind_after: Duration::hours(file.sweeps.reminder_hours),
            expire_after: Duration::days(file.sweeps.expire_days),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_after <= Duration::zero()
            || self.remind_after <= Duration::zero()
            || self.expire_after <= Duration::zero()
        {
            return Err(ConfigError::Invalid("sweep ages must be positive".to_string()));
        }
        if self.remind_after >= self.timeout_after {
            return Err(ConfigError::Invalid(
                "reminder age must be shorter than the escalation age".to_string(),
            ));
        }
        if self.expire_after <= self.timeout_after {
            return Err(ConfigError::Invalid(
                "expiration age must be longer than the escalation age".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::{ConfigError, EngineConfig};

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn parses_a_sweeps_table() {
        let config = EngineConfig::from_toml_str(
            "[sweeps]\ntimeout_hours = 48\nreminder_hours = 12\nexpire_days = 30\n",
        )
        .expect("parse");
        assert_eq!(config.timeout_after, Duration::hours(48));
        assert_eq!(config.remind_after, Duration::hours(12));
        assert_eq!(config.expire_after, Duration::days(30));
    }

    #[test]
    fn missing_table_falls_back_to_defaults() {
        let config = EngineConfig::from_toml_str("").expect("parse");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn rejects_reminder_not_shorter_than_timeout() {
        let error = EngineConfig::from_toml_str(
            "[sweeps]\ntimeout_hours = 8\nreminder_hours = 8\nexpire_days = 14\n",
        )
        .expect_err("must reject");
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_sweep_keys() {
        let error = EngineConfig::from_toml_str(
            "[sweeps]\ntimeout_hours = 8\nreminder_hours = 2\nexpire_days = 14\nretry_count = 3\n",
        )
        .expect_err("must reject");
        assert!(matches!(error, ConfigError::Parse(_)));
    }
}
