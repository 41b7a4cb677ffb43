//! Bounded polling until an asynchronous remote step reaches a terminal status.
//!
//! This is a wait-for-completion loop, not retry-on-failure: an error from
//! the status check ends the wait immediately.

use crate::error::{Error, Result};
use crate::types::Observation;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

/// Polling configuration and status classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessPoller {
    /// Statuses meaning "keep waiting"
    pub pending: Vec<String>,
    /// Statuses meaning "done"
    pub target: Vec<String>,
    /// Give up after this long
    pub timeout: Duration,
    /// Delay between checks
    pub poll_interval: Duration,
    /// Floor for the delay between checks
    pub min_interval: Duration,
    /// Consecutive target observations required before succeeding
    pub required_target_observations: u32,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self {
            pending: vec!["pending".to_string()],
            target: vec!["ready".to_string()],
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            min_interval: Duration::from_secs(1),
            required_target_observations: 1,
        }
    }
}

impl ReadinessPoller {
    /// Create a poller for the given pending and target statuses.
    pub fn new<P, T>(pending: P, target: T) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_required_observations(mut self, count: u32) -> Self {
        self.required_target_observations = count;
        self
    }

    /// Delay actually slept between checks.
    pub fn interval(&self) -> Duration {
        self.poll_interval.max(self.min_interval)
    }

    /// Poll `check` until it reports a target status often enough in a row.
    ///
    /// Returns the final observation. A status that is neither pending nor
    /// target fails with [`Error::DeploymentFailed`]; running out of time
    /// fails with [`Error::Timeout`].
    pub fn wait_for<F>(&self, identity: &str, target_version: u32, mut check: F) -> Result<Observation>
    where
        F: FnMut() -> Result<Observation>,
    {
        let start = Instant::now();
        let required = self.required_target_observations.max(1);
        let mut consecutive = 0;

        loop {
            let observation = check()?;
            log::trace!(
                "{} (version {}): status `{}`",
                identity,
                target_version,
                observation.status
            );

            if self.target.contains(&observation.status) {
                consecutive += 1;
                if consecutive >= required {
                    log::debug!(
                        "{} (version {}) reached `{}` after {:?}",
                        identity,
                        target_version,
                        observation.status,
                        start.elapsed()
                    );
                    return Ok(observation);
                }
            } else if self.pending.contains(&observation.status) {
                consecutive = 0;
            } else {
                return Err(Error::DeploymentFailed {
                    identity: identity.to_string(),
                    version: target_version,
                    message: observation.message.unwrap_or_default(),
                    status: observation.status,
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(Error::Timeout {
                    identity: identity.to_string(),
                    version: target_version,
                    last_status: observation.status,
                    elapsed_ms: elapsed.as_millis(),
                });
            }

            thread::sleep(self.interval().min(self.timeout - elapsed));
        }
    }
}
