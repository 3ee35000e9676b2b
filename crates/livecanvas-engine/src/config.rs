use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::publish::RetryPolicy;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
const QUEUE_CAPACITY_MAX: usize = 4096;
const PUBLISH_RETRIES_MAX: usize = 20;
const PUBLISH_RETRY_DELAY_MS_MAX: u64 = 1000;
const IDLE_BACKOFF_MIN_MS_DEFAULT: u64 = 1;
const IDLE_BACKOFF_MIN_MS_MAX: u64 = 100;
const IDLE_BACKOFF_MAX_MS_DEFAULT: u64 = 25;
const IDLE_BACKOFF_MAX_MS_MAX: u64 = 1000;

/// What the control loop does when the synthesis engine returns an error.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EngineFailurePolicy {
    /// Log, keep the previous artifact, wait for the next parameter change.
    #[default]
    Skip,
    /// Stop the loop and surface the error.
    Fatal,
}

impl FromStr for EngineFailurePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "fatal" => Ok(Self::Fatal),
            other => Err(format!(
                "unknown engine failure policy: {other} (expected skip|fatal)"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IdleBackoffSettings {
    pub min: Duration,
    pub max: Duration,
}

impl Default for IdleBackoffSettings {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(IDLE_BACKOFF_MIN_MS_DEFAULT),
            max: Duration::from_millis(IDLE_BACKOFF_MAX_MS_DEFAULT),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoopSettings {
    pub queue_capacity: usize,
    pub publish_retry: RetryPolicy,
    pub idle_backoff: IdleBackoffSettings,
    pub engine_failure: EngineFailurePolicy,
    pub debug: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            publish_retry: RetryPolicy::default(),
            idle_backoff: IdleBackoffSettings::default(),
            engine_failure: EngineFailurePolicy::default(),
            debug: false,
        }
    }
}

impl LoopSettings {
    /// Defaults with `LIVECANVAS_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<u64>().ok());

        let queue_capacity = parsed("LIVECANVAS_QUEUE_CAPACITY")
            .map(|value| (value as usize).clamp(1, QUEUE_CAPACITY_MAX))
            .unwrap_or(defaults.queue_capacity);
        let attempts = parsed("LIVECANVAS_PUBLISH_RETRIES")
            .map(|value| (value as usize).clamp(1, PUBLISH_RETRIES_MAX))
            .unwrap_or(defaults.publish_retry.attempts);
        let delay = parsed("LIVECANVAS_PUBLISH_RETRY_DELAY_MS")
            .map(|value| Duration::from_millis(value.min(PUBLISH_RETRY_DELAY_MS_MAX)))
            .unwrap_or(defaults.publish_retry.delay);
        let idle_min = parsed("LIVECANVAS_IDLE_BACKOFF_MIN_MS")
            .map(|value| Duration::from_millis(value.min(IDLE_BACKOFF_MIN_MS_MAX)))
            .unwrap_or(defaults.idle_backoff.min);
        let idle_max = parsed("LIVECANVAS_IDLE_BACKOFF_MAX_MS")
            .map(|value| Duration::from_millis(value.clamp(1, IDLE_BACKOFF_MAX_MS_MAX)))
            .unwrap_or(defaults.idle_backoff.max);

        Self {
            queue_capacity,
            publish_retry: RetryPolicy { attempts, delay },
            idle_backoff: IdleBackoffSettings {
                min: idle_min.min(idle_max),
                max: idle_max,
            },
            ..defaults
        }
    }
}
