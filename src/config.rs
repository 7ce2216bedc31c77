//! Runtime configuration: store timeouts, retry budget, countdown and retention windows.

use std::{
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

use crate::{services::retry::RetryPolicy, state::game::Difficulty};

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "NOCAP_SYNC_CONFIG_PATH";

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_ROUND_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_SNAPSHOT_VALIDITY: Duration = Duration::from_secs(10 * 60);
const DEFAULT_GAME_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);
const DEFAULT_GAME_ID_ATTEMPTS: u32 = 10;

/// Immutable runtime configuration shared by every service of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Deadline applied to every single store operation.
    pub store_timeout: Duration,
    /// Backoff applied when a store operation fails transiently.
    pub retry: RetryPolicy,
    /// Upper bound for a local phase transition including its store work.
    pub transition_timeout: Duration,
    /// Countdown length of a round.
    pub round_duration: Duration,
    /// Maximum age of an offline snapshot that is still replayed on reconnect.
    pub snapshot_validity: Duration,
    /// Games older than this are removed by the cleanup pass.
    pub game_retention: Duration,
    /// Cadence of the countdown redraw loop.
    pub frame_interval: Duration,
    /// How many random game codes are tried before giving up.
    pub game_id_attempts: u32,
    multipliers: Multipliers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Multipliers {
    easy: u32,
    medium: u32,
    hard: u32,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        Self::load_from(&resolve_config_path())
    }

    /// Load the configuration from `path`. A missing or broken file yields the defaults.
    pub fn load_from(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file, using defaults");
                return Self::default();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable config file, using defaults");
                return Self::default();
            }
        };

        serde_json::from_str::<RawConfig>(&contents)
            .map(|raw| {
                info!(path = %path.display(), "configuration loaded");
                Self::from(raw)
            })
            .unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "invalid config file, using defaults");
                Self::default()
            })
    }

    /// Penalty multiplier applied to estimation errors at the given difficulty.
    pub fn multiplier(&self, difficulty: Difficulty) -> u32 {
        match difficulty {
            Difficulty::Easy => self.multipliers.easy,
            Difficulty::Medium => self.multipliers.medium,
            Difficulty::Hard => self.multipliers.hard,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            retry: RetryPolicy::default(),
            transition_timeout: DEFAULT_TRANSITION_TIMEOUT,
            round_duration: DEFAULT_ROUND_DURATION,
            snapshot_validity: DEFAULT_SNAPSHOT_VALIDITY,
            game_retention: DEFAULT_GAME_RETENTION,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            game_id_attempts: DEFAULT_GAME_ID_ATTEMPTS,
            multipliers: Multipliers {
                easy: 1,
                medium: 2,
                hard: 3,
            },
        }
    }
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    store_timeout_ms: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    transition_timeout_ms: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    round_duration_ms: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    snapshot_validity_ms: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    game_retention_ms: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    frame_interval_ms: Option<Duration>,
    game_id_attempts: Option<u32>,
    retry: Option<RawRetry>,
    multipliers: Option<RawMultipliers>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// JSON representation of the `retry` section.
struct RawRetry {
    max_attempts: Option<u32>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    base_delay_ms: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    max_delay_ms: Option<Duration>,
    jitter: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// JSON representation of the per-difficulty multipliers.
struct RawMultipliers {
    easy: Option<u32>,
    medium: Option<u32>,
    hard: Option<u32>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = AppConfig::default();

        let retry = value.retry.map_or(defaults.retry, |raw| RetryPolicy {
            max_attempts: raw
                .max_attempts
                .unwrap_or(defaults.retry.max_attempts)
                .max(1),
            base_delay: raw.base_delay_ms.unwrap_or(defaults.retry.base_delay),
            max_delay: raw.max_delay_ms.unwrap_or(defaults.retry.max_delay),
            jitter: raw
                .jitter
                .unwrap_or(defaults.retry.jitter)
                .clamp(0.0, 1.0),
        });

        let multipliers = value.multipliers.map_or(defaults.multipliers, |raw| Multipliers {
            easy: raw.easy.unwrap_or(defaults.multipliers.easy),
            medium: raw.medium.unwrap_or(defaults.multipliers.medium),
            hard: raw.hard.unwrap_or(defaults.multipliers.hard),
        });

        Self {
            store_timeout: value.store_timeout_ms.unwrap_or(defaults.store_timeout),
            retry,
            transition_timeout: value
                .transition_timeout_ms
                .unwrap_or(defaults.transition_timeout),
            round_duration: value.round_duration_ms.unwrap_or(defaults.round_duration),
            snapshot_validity: value
                .snapshot_validity_ms
                .unwrap_or(defaults.snapshot_validity),
            game_retention: value.game_retention_ms.unwrap_or(defaults.game_retention),
            frame_interval: value.frame_interval_ms.unwrap_or(defaults.frame_interval),
            game_id_attempts: value
                .game_id_attempts
                .unwrap_or(defaults.game_id_attempts)
                .max(1),
            multipliers,
        }
    }
}

fn resolve_config_path() -> PathBuf {
    match env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}
