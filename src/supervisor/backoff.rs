//! Restart pacing for crashing workers.
//!
//! A death long after the previous one is restarted at once. Deaths that keep
//! coming within [`RESTART_WINDOW_SECS`] grow the delay exponentially up to a
//! cap, and a streak longer than [`RESTART_MAX_STREAK`] exhausts the policy.

use std::time::{Duration, Instant};

use crate::config::{
    RESTART_BACKOFF_BASE_MS, RESTART_BACKOFF_MAX_MS, RESTART_MAX_STREAK, RESTART_WINDOW_SECS,
};

#[derive(Debug, Clone)]
pub struct RestartBackoff {
    window: Duration,
    base: Duration,
    max: Duration,
    max_streak: u32,
    streak: u32,
    last_death: Option<Instant>,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(RESTART_WINDOW_SECS),
            Duration::from_millis(RESTART_BACKOFF_BASE_MS),
            Duration::from_millis(RESTART_BACKOFF_MAX_MS),
            RESTART_MAX_STREAK,
        )
    }
}

impl RestartBackoff {
    pub fn new(window: Duration, base: Duration, max: Duration, max_streak: u32) -> Self {
        Self {
            window,
            base,
            max,
            max_streak,
            streak: 0,
            last_death: None,
        }
    }

    /// Record a worker death at `now` and return how long to wait before
    /// restarting it, or `None` once the restart streak is exhausted.
    pub fn on_death(&mut self, now: Instant) -> Option<Duration> {
        let recurring = self
            .last_death
            .is_some_and(|last| now.saturating_duration_since(last) < self.window);
        self.last_death = Some(now);

        if !recurring {
            self.streak = 0;
            return Some(Duration::ZERO);
        }

        self.streak += 1;
        if self.streak > self.max_streak {
            return None;
        }

        let factor = 1u32.checked_shl(self.streak - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> RestartBackoff {
        RestartBackoff::new(
            Duration::from_secs(10),
            Duration::from_millis(100),
            Duration::from_millis(1000),
            5,
        )
    }

    #[test]
    fn test_first_death_restarts_immediately() {
        let mut b = backoff();
        assert_eq!(b.on_death(Instant::now()), Some(Duration::ZERO));
        assert_eq!(b.streak(), 0);
    }

    #[test]
    fn test_recurring_deaths_back_off_exponentially() {
        let mut b = backoff();
        let t = Instant::now();
        assert_eq!(b.on_death(t), Some(Duration::ZERO));
        assert_eq!(b.on_death(t + Duration::from_secs(1)), Some(Duration::from_millis(100)));
        assert_eq!(b.on_death(t + Duration::from_secs(2)), Some(Duration::from_millis(200)));
        assert_eq!(b.on_death(t + Duration::from_secs(3)), Some(Duration::from_millis(400)));
        assert_eq!(b.on_death(t + Duration::from_secs(4)), Some(Duration::from_millis(800)));
        // capped
        assert_eq!(b.on_death(t + Duration::from_secs(5)), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_quiet_period_resets_streak() {
        let mut b = backoff();
        let t = Instant::now();
        b.on_death(t);
        b.on_death(t + Duration::from_secs(1));
        b.on_death(t + Duration::from_secs(2));
        assert_eq!(b.streak(), 2);
        assert_eq!(b.on_death(t + Duration::from_secs(30)), Some(Duration::ZERO));
        assert_eq!(b.streak(), 0);
    }

    #[test]
    fn test_long_streak_exhausts() {
        let mut b = backoff();
        let t = Instant::now();
        for i in 0..=5 {
            assert!(b.on_death(t + Duration::from_millis(i * 10)).is_some());
        }
        assert_eq!(b.on_death(t + Duration::from_millis(60)), None);
    }
}
