//! Worker configuration, loaded from `LCMS_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{JobExecutorConfig, RetryPolicies, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// How a bundle learns that its children are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Re-invoke the bundle and scan the queue until nothing of the request
    /// is left.
    Poll,
    /// Children count down a barrier; the last one wakes the bundle.
    #[default]
    Counter,
}

impl FromStr for JoinStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" => Ok(JoinStrategy::Poll),
            "counter" => Ok(JoinStrategy::Counter),
            _ => Err(ConfigError::Invalid {
                key: "LCMS_JOIN_STRATEGY".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Bounds on how long a bundle may keep waiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferralPolicy {
    /// `None` = unbounded.
    pub max_deferrals: Option<u32>,
    /// Measured from the first request; `None` = no deadline.
    pub deadline: Option<Duration>,
    /// Delay before a deferred bundle runs again.
    pub requeue_delay: Duration,
}

impl Default for DeferralPolicy {
    fn default() -> Self {
        Self {
            max_deferrals: Some(1000),
            deadline: Some(Duration::from_secs(3600)),
            requeue_delay: Duration::from_secs(2),
        }
    }
}

impl DeferralPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_deferrals: None,
            deadline: None,
            requeue_delay: Duration::ZERO,
        }
    }

    /// Why another deferral is not allowed, if it is not.
    pub fn exceeded(&self, deferrals: u32, first_requested_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<String> {
        if let Some(max) = self.max_deferrals {
            if deferrals >= max {
                return Some(format!("gave up after {deferrals} deferrals"));
            }
        }
        if let (Some(deadline), Some(first)) = (self.deadline, first_requested_at) {
            if self.deadline_passed(first, now) {
                return Some(format!("not finished within {}s of the request", deadline.as_secs()));
            }
        }
        None
    }

    pub fn deadline_passed(&self, first_requested_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.deadline_at(first_requested_at) {
            Some(at) => now >= at,
            None => false,
        }
    }

    pub fn deadline_at(&self, first_requested_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let deadline = chrono::Duration::from_std(self.deadline?).ok()?;
        first_requested_at.checked_add_signed(deadline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Storage prefix of assembled bundles.
    pub bundle_root: String,
    pub join_strategy: JoinStrategy,
    pub deferral: DeferralPolicy,
    pub lock_timeout: Duration,
    pub child_max_attempts: u32,
    pub child_retry_delay: Duration,
    pub workers: usize,
    pub poll_interval: Duration,
    /// How long finished jobs, barriers and outcomes are kept.
    pub retention: Duration,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            bundle_root: "bundles".to_string(),
            join_strategy: JoinStrategy::Counter,
            deferral: DeferralPolicy::default(),
            lock_timeout: Duration::from_secs(10),
            child_max_attempts: 3,
            child_retry_delay: Duration::from_secs(5),
            workers: 4,
            poll_interval: Duration::from_millis(100),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BundleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(root) = lookup("LCMS_BUNDLE_ROOT") {
            config.bundle_root = root;
        }
        if let Some(strategy) = lookup("LCMS_JOIN_STRATEGY") {
            config.join_strategy = strategy.parse()?;
        }
        if let Some(max) = parse::<u32>(&lookup, "LCMS_MAX_DEFERRALS")? {
            config.deferral.max_deferrals = (max > 0).then_some(max);
        }
        if let Some(secs) = parse::<u64>(&lookup, "LCMS_BUNDLE_DEADLINE_SECS")? {
            config.deferral.deadline = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = parse::<u64>(&lookup, "LCMS_REQUEUE_DELAY_MS")? {
            config.deferral.requeue_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "LCMS_LOCK_TIMEOUT_MS")? {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse::<u32>(&lookup, "LCMS_CHILD_MAX_ATTEMPTS")? {
            config.child_max_attempts = attempts;
        }
        if let Some(ms) = parse::<u64>(&lookup, "LCMS_CHILD_RETRY_DELAY_MS")? {
            config.child_retry_delay = Duration::from_millis(ms);
        }
        if let Some(workers) = parse::<usize>(&lookup, "LCMS_WORKERS")? {
            config.workers = workers;
        }
        if let Some(ms) = parse::<u64>(&lookup, "LCMS_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "LCMS_RETENTION_SECS")? {
            config.retention = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn retry_policies(&self) -> RetryPolicies {
        RetryPolicies::new(RetryPolicy::fixed(self.child_max_attempts, self.child_retry_delay))
    }

    pub fn executor_config(&self) -> JobExecutorConfig {
        JobExecutorConfig::default().with_poll_interval(self.poll_interval)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
            })
        })
        .transpose()
}
