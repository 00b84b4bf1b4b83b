use rand::Rng;
use std::time::Duration;

/// When and how often a dead GPU telemetry stream is relaunched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Relaunch at all; when false a dead stream leaves its values stale.
    pub enabled: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Give up after this many relaunches; `None` retries forever.
    pub max_restarts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(60_000),
            max_restarts: None,
        }
    }
}

impl RestartPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn allows_restart(&self, restarts_so_far: u32) -> bool {
        self.enabled && self.max_restarts.map_or(true, |max| restarts_so_far < max)
    }
}

/// Exponential backoff: each delay doubles the previous one up to `max`.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            jitter: true,
        }
    }

    pub fn from_policy(policy: &RestartPolicy) -> Self {
        Self::new(policy.initial_backoff, policy.max_backoff)
    }

    /// Disable the up-to-10% random extension of each delay.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        if !self.jitter {
            return base;
        }
        let spread = base.as_millis() as u64 / 10;
        if spread == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=spread);
        (base + Duration::from_millis(extra)).min(self.max)
    }

    /// Back to the initial delay after a healthy session.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
