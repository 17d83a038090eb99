//! External liveness prober.
//!
//! Polls the liveness endpoint the way a container orchestrator does: one
//! request per interval, each bounded by a timeout, and only a run of
//! consecutive failures past the start period marks the target down.

use std::time::{Duration, Instant};

use reqwest::StatusCode;

use crate::config::{
    PROBE_INTERVAL_SECS, PROBE_RETRIES, PROBE_START_PERIOD_SECS, PROBE_TIMEOUT_SECS,
};
use crate::health::{HealthResult, HealthStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(PROBE_INTERVAL_SECS),
            timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
            retries: PROBE_RETRIES,
            start_period: Duration::from_secs(PROBE_START_PERIOD_SECS),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeFailure {
    #[error("Liveness endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("Liveness endpoint did not answer within {0:?}")]
    TimedOut(Duration),
    #[error("Liveness endpoint answered {0}")]
    Status(StatusCode),
}

/// What the orchestrator should conclude after a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Still starting; failures are not counted yet
    Starting,
    /// Failing, but fewer than `retries` times in a row
    Failing(u32),
    /// `retries` consecutive failures: replace this instance
    Down,
}

/// Consecutive-failure accounting for one target.
#[derive(Debug)]
pub struct ProbeTracker {
    policy: ProbePolicy,
    started_at: Instant,
    consecutive_failures: u32,
    seen_healthy: bool,
}

impl ProbeTracker {
    pub fn new(policy: ProbePolicy, started_at: Instant) -> Self {
        Self {
            policy,
            started_at,
            consecutive_failures: 0,
            seen_healthy: false,
        }
    }

    /// Fold one probe result in. A success ends the start period early;
    /// failures inside the start period are ignored.
    pub fn record(&mut self, healthy: bool, at: Instant) -> Verdict {
        if healthy {
            self.consecutive_failures = 0;
            self.seen_healthy = true;
            return Verdict::Healthy;
        }

        let in_start_period =
            !self.seen_healthy && at.saturating_duration_since(self.started_at) < self.policy.start_period;
        if in_start_period {
            return Verdict::Starting;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.policy.retries {
            Verdict::Down
        } else {
            Verdict::Failing(self.consecutive_failures)
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Polls one liveness URL.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
    url: String,
    policy: ProbePolicy,
}

impl HealthProber {
    pub fn new(url: impl Into<String>, policy: ProbePolicy) -> Result<Self, ProbeFailure> {
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .build()
            .map_err(|e| ProbeFailure::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            policy,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One probe. Only a 200 within the timeout counts as healthy.
    pub async fn probe_once(&self) -> Result<HealthStatus, ProbeFailure> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeFailure::TimedOut(self.policy.timeout)
            } else {
                ProbeFailure::Unreachable(e.to_string())
            }
        })?;

        match response.status() {
            StatusCode::OK => Ok(HealthStatus::now(HealthResult::Healthy)),
            status => Err(ProbeFailure::Status(status)),
        }
    }

    /// Probe every interval until the target is judged down.
    pub async fn watch(&self) -> Verdict {
        let mut tracker = ProbeTracker::new(self.policy, Instant::now());
        let mut interval = tokio::time::interval(self.policy.interval);

        loop {
            interval.tick().await;
            let result = self.probe_once().await;
            let verdict = tracker.record(result.is_ok(), Instant::now());

            match (&result, verdict) {
                (Ok(_), _) => tracing::debug!(url = %self.url, "Probe healthy"),
                (Err(e), Verdict::Starting) => {
                    tracing::info!(url = %self.url, error = %e, "Probe failed during start period")
                }
                (Err(e), Verdict::Failing(n)) => tracing::warn!(
                    url = %self.url,
                    error = %e,
                    consecutive = n,
                    retries = self.policy.retries,
                    "Probe failed"
                ),
                (Err(e), _) => {
                    tracing::error!(url = %self.url, error = %e, "Target is down");
                }
            }

            if verdict == Verdict::Down {
                return verdict;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ProbePolicy {
        ProbePolicy {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            retries: 3,
            start_period: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_default_policy_matches_healthcheck() {
        assert_eq!(ProbePolicy::default(), policy());
    }

    #[test]
    fn test_failures_in_start_period_ignored() {
        let t = Instant::now();
        let mut tracker = ProbeTracker::new(policy(), t);
        assert_eq!(tracker.record(false, t + Duration::from_secs(1)), Verdict::Starting);
        assert_eq!(tracker.record(false, t + Duration::from_secs(4)), Verdict::Starting);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn test_three_consecutive_failures_mark_down() {
        let t = Instant::now();
        let mut tracker = ProbeTracker::new(policy(), t);
        let after = t + Duration::from_secs(6);
        assert_eq!(tracker.record(false, after), Verdict::Failing(1));
        assert_eq!(tracker.record(false, after), Verdict::Failing(2));
        assert_eq!(tracker.record(false, after), Verdict::Down);
    }

    #[test]
    fn test_success_resets_failures() {
        let t = Instant::now();
        let mut tracker = ProbeTracker::new(policy(), t);
        let after = t + Duration::from_secs(6);
        tracker.record(false, after);
        tracker.record(false, after);
        assert_eq!(tracker.record(true, after), Verdict::Healthy);
        assert_eq!(tracker.record(false, after), Verdict::Failing(1));
    }

    #[test]
    fn test_success_ends_start_period() {
        let t = Instant::now();
        let mut tracker = ProbeTracker::new(policy(), t);
        assert_eq!(tracker.record(true, t + Duration::from_secs(1)), Verdict::Healthy);
        assert_eq!(tracker.record(false, t + Duration::from_secs(2)), Verdict::Failing(1));
    }

    #[tokio::test]
    async fn test_unreachable_target_fails() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = HealthProber::new(format!("http://{}/health", addr), policy()).unwrap();
        assert!(matches!(
            prober.probe_once().await,
            Err(ProbeFailure::Unreachable(_))
        ));
    }
}
