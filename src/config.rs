//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Shortest and longest allowed poll interval.
const MIN_POLL_SECS: u64 = 60;
const MAX_POLL_SECS: u64 = 120;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often the dispatcher scans the schedule store.
    pub poll_interval: Duration,
    /// How far a main-track send is pushed back when it collides with a reminder.
    pub conflict_grace: Duration,
    /// Delay before the main funnel is re-seeded after an unanswered direct reminder.
    pub recovery_delay: Duration,
    /// Upper bound on a single gateway call.
    pub send_timeout: Duration,
    /// Whether the ticker also runs the reclaimer sweep after each cycle.
    pub reclaim_sweep: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            conflict_grace: Duration::from_secs(10 * 60),
            recovery_delay: Duration::from_secs(60 * 60),
            send_timeout: Duration::from_secs(15),
            reclaim_sweep: true,
        }
    }
}

impl DispatcherConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let poll_secs = env_parse::<u64>("FUNNEL_POLL_INTERVAL_SECS")
            .unwrap_or(defaults.poll_interval.as_secs())
            .clamp(MIN_POLL_SECS, MAX_POLL_SECS);

        Self {
            poll_interval: Duration::from_secs(poll_secs),
            conflict_grace: env_parse::<u64>("FUNNEL_CONFLICT_GRACE_MIN")
                .map(minutes)
                .unwrap_or(defaults.conflict_grace),
            recovery_delay: env_parse::<u64>("FUNNEL_RECOVERY_DELAY_MIN")
                .map(minutes)
                .unwrap_or(defaults.recovery_delay),
            send_timeout: env_parse::<u64>("FUNNEL_SEND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.send_timeout),
            reclaim_sweep: env_parse::<bool>("FUNNEL_RECLAIM_SWEEP")
                .unwrap_or(defaults.reclaim_sweep),
        }
    }
}

/// Inactivity reclaimer configuration.
#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// Users idle for longer than this are considered inactive.
    pub inactivity_threshold: Duration,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold: Duration::from_secs(4 * 24 * 60 * 60), // 4 days
        }
    }
}

impl ReclaimerConfig {
    pub fn from_env() -> Self {
        match env_parse::<u64>("FUNNEL_INACTIVITY_DAYS") {
            Some(n) => Self {
                inactivity_threshold: days(n),
            },
            None => Self::default(),
        }
    }
}

/// Storage and content locations.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Optional JSON message catalog. Without it the built-in catalog is used.
    pub messages_path: Option<PathBuf>,
    /// Optional JSON funnel graph. Without it the shipped graph is used.
    pub graph_path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("FUNNEL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/funnel.db")),
            messages_path: std::env::var("FUNNEL_MESSAGES_PATH").ok().map(PathBuf::from),
            graph_path: std::env::var("FUNNEL_GRAPH_PATH").ok().map(PathBuf::from),
        }
    }
}

/// Telegram gateway configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Parse mode passed to `sendMessage`.
    pub parse_mode: String,
}

impl TelegramConfig {
    /// Read the bot token. Fails when `TELEGRAM_BOT_TOKEN` is unset or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;

        Ok(Self {
            bot_token: SecretString::from(token),
            parse_mode: std::env::var("TELEGRAM_PARSE_MODE").unwrap_or_else(|_| "HTML".into()),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

fn days(d: u64) -> Duration {
    Duration::from_secs(d.saturating_mul(24 * 60 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.conflict_grace, Duration::from_secs(600));
        assert!(config.reclaim_sweep);
    }

    #[test]
    fn reclaimer_default_is_four_days() {
        let config = ReclaimerConfig::default();
        assert_eq!(config.inactivity_threshold.as_secs(), 4 * 86_400);
    }

    #[test]
    fn minutes_helper() {
        assert_eq!(minutes(10), Duration::from_secs(600));
        assert_eq!(days(2), Duration::from_secs(2 * 86_400));
    }

    #[test]
    fn huge_env_values_saturate() {
        assert_eq!(minutes(u64::MAX), Duration::from_secs(u64::MAX));
        assert_eq!(days(u64::MAX), Duration::from_secs(u64::MAX));
    }
}
