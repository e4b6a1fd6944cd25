use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

/// Runtime configuration for the dispatch engine: the six options in the spec's
/// configuration table, each with its documented default.
#[derive(Envconfig, Debug, Clone)]
pub struct EngineConfig {
    /// Max age of an unACKed assignment before it is revoked.
    #[envconfig(from = "ASSIGNMENT_TIMEOUT_MS", default = "20000")]
    pub assignment_timeout: EnvMsDuration,

    /// Period between client poll-hint bursts.
    #[envconfig(from = "NOTIFICATION_INTERVAL_MS", default = "500")]
    pub notification_interval: EnvMsDuration,

    /// How long a subscription may be idle before it is unsubscribed.
    #[envconfig(from = "INACTIVITY_THRESHOLD_MS", default = "600000")]
    pub inactivity_threshold: EnvMsDuration,

    /// Expiration task period.
    #[envconfig(from = "CLEAN_INTERVAL_MS", default = "15000")]
    pub clean_interval: EnvMsDuration,

    /// Upper bound on the dispatch worker's idle sleep.
    #[envconfig(from = "WAIT_MAX_MS", default = "5000")]
    pub wait_max: EnvMsDuration,

    /// Per-phase max items processed before a phase yields.
    #[envconfig(from = "FAIRNESS_CAP", default = "200")]
    pub fairness_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assignment_timeout: EnvMsDuration(Duration::from_secs(20)),
            notification_interval: EnvMsDuration(Duration::from_millis(500)),
            inactivity_threshold: EnvMsDuration(Duration::from_secs(600)),
            clean_interval: EnvMsDuration(Duration::from_secs(15)),
            wait_max: EnvMsDuration(Duration::from_secs(5)),
            fairness_cap: 200,
        }
    }
}

/// A `Duration` parsed from a millisecond count in an environment variable.
#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = EngineConfig::default();
        assert_eq!(config.assignment_timeout.0, Duration::from_secs(20));
        assert_eq!(config.notification_interval.0, Duration::from_millis(500));
        assert_eq!(config.inactivity_threshold.0, Duration::from_secs(600));
        assert_eq!(config.clean_interval.0, Duration::from_secs(15));
        assert_eq!(config.wait_max.0, Duration::from_secs(5));
        assert_eq!(config.fairness_cap, 200);
    }

    #[test]
    fn parses_ms_from_env_string() {
        let parsed: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(parsed.0, Duration::from_millis(1500));
        assert!("not-a-number".parse::<EnvMsDuration>().is_err());
    }
}
