//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Clarification questions allowed per item before escalation.
pub const CLARIFICATION_MAX_ATTEMPTS: u32 = 2;

/// Default trailing noise words stripped from requested target names.
pub const DEFAULT_MATCH_SUFFIXES: &[&str] = &["request", "ticket", "project", "service", "system", "account"];

/// Retry policy for transient collaborator failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps (for tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the record log.
    pub store_path: PathBuf,
    /// New items per cycle above which the guardrail blocks the cycle.
    pub mass_item_threshold: usize,
    /// Minimum classifier confidence (0-100) for auto-processing.
    pub classification_confidence_threshold: u8,
    /// Minimum extraction completeness (0-100) before matching.
    pub completeness_threshold: u8,
    /// Non-terminal items untouched for this long are force-escalated.
    pub stale_hours: u32,
    /// How far back the transport looks for new messages.
    pub fetch_since_days: u32,
    /// Wait between cycles.
    pub cycle_interval: Duration,
    /// Candidates requested from catalog search.
    pub search_top_k: usize,
    /// Who receives escalated items.
    pub escalation_recipients: Vec<String>,
    /// Who receives guardrail alerts (no alert when unset).
    pub alert_recipient: Option<String>,
    /// Noise words stripped from the end of requested target names.
    pub match_suffixes: Vec<String>,
    /// Retry policy for transport, search and LLM calls.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./data/items.jsonl"),
            mass_item_threshold: 20,
            classification_confidence_threshold: 70,
            completeness_threshold: 60,
            stale_hours: 24,
            fetch_since_days: 3,
            cycle_interval: Duration::from_secs(300),
            search_top_k: 5,
            escalation_recipients: Vec::new(),
            alert_recipient: None,
            match_suffixes: DEFAULT_MATCH_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Build config from `INTAKE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            store_path: std::env::var("INTAKE_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            mass_item_threshold: parse_env("INTAKE_MASS_ITEM_THRESHOLD")?
                .unwrap_or(defaults.mass_item_threshold),
            classification_confidence_threshold: parse_env("INTAKE_CLASSIFICATION_THRESHOLD")?
                .unwrap_or(defaults.classification_confidence_threshold),
            completeness_threshold: parse_env("INTAKE_COMPLETENESS_THRESHOLD")?
                .unwrap_or(defaults.completeness_threshold),
            stale_hours: parse_env("INTAKE_STALE_HOURS")?.unwrap_or(defaults.stale_hours),
            fetch_since_days: parse_env("INTAKE_FETCH_SINCE_DAYS")?
                .unwrap_or(defaults.fetch_since_days),
            cycle_interval: parse_env("INTAKE_CYCLE_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cycle_interval),
            search_top_k: parse_env("INTAKE_SEARCH_TOP_K")?.unwrap_or(defaults.search_top_k),
            escalation_recipients: std::env::var("INTAKE_ESCALATION_RECIPIENTS")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.escalation_recipients),
            alert_recipient: std::env::var("INTAKE_ALERT_RECIPIENT")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            match_suffixes: std::env::var("INTAKE_MATCH_SUFFIXES")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.match_suffixes),
            retry: RetryPolicy {
                max_attempts: parse_env("INTAKE_RETRY_MAX_ATTEMPTS")?
                    .unwrap_or(defaults.retry.max_attempts),
                base_delay: parse_env("INTAKE_RETRY_BASE_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_delay),
                max_delay: parse_env("INTAKE_RETRY_MAX_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.max_delay),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mass_item_threshold == 0 {
            return Err(invalid("mass_item_threshold", "must be at least 1"));
        }
        if self.classification_confidence_threshold > 100 {
            return Err(invalid(
                "classification_confidence_threshold",
                "must be between 0 and 100",
            ));
        }
        if self.completeness_threshold > 100 {
            return Err(invalid("completeness_threshold", "must be between 0 and 100"));
        }
        if self.stale_hours == 0 {
            return Err(invalid("stale_hours", "must be at least 1"));
        }
        if self.search_top_k == 0 {
            return Err(invalid("search_top_k", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "INTAKE_STORE_PATH".into(),
                hint: "Set it to the record log location".into(),
            });
        }
        Ok(())
    }

    /// Staleness threshold as a chrono duration.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.stale_hours))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, &e.to_string())),
        _ => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
