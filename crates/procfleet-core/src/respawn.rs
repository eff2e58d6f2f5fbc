//! Respawn policy and per-record attempt tracking.
//!
//! When a supervised child exits without being asked to, the supervisor may
//! relaunch it. How often and how fast is governed here:
//!
//! - [`RespawnPolicy`] is the fleet-wide configuration: attempt cap,
//!   backoff curve, and the flat interval used for slow respawn.
//! - [`RespawnTracker`] is the per-record counter. It only ever counts
//!   consecutive failures; a successful authentication resets it, so a
//!   process that crashes once a day never exhausts its budget.
//! - [`RespawnDirective`] carries the per-exit overrides: `unlimited`
//!   ignores the cap, `slow` swaps the backoff curve for the flat interval.

use std::time::Duration;

/// Default cap on consecutive respawn attempts.
pub const DEFAULT_MAX_RESPAWNS: u32 = 5;

/// Default flat interval for slow respawn.
pub const DEFAULT_SLOW_INTERVAL: Duration = Duration::from_secs(10);

/// Backoff curve between respawn attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffConfig {
    /// Same delay before every attempt.
    Fixed { delay: Duration },
    /// Delay grows by `multiplier` per attempt, clamped to `max_delay`.
    Exponential {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    },
}

impl BackoffConfig {
    /// Delay before the given attempt. Attempts are 1-based: attempt 1 is
    /// the first relaunch after the initial spawn.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exp = attempt.saturating_sub(1).min(16);
                let factor = u64::from(multiplier).saturating_pow(exp);
                initial_delay
                    .checked_mul(u32::try_from(factor).unwrap_or(u32::MAX))
                    .map_or(max_delay, |d| d.min(max_delay))
            }
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2,
        }
    }
}

/// Fleet-wide respawn configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespawnPolicy {
    /// Cap on consecutive attempts; ignored under an `unlimited` directive.
    pub max_respawns: u32,
    /// Backoff curve for normal respawn.
    pub backoff: BackoffConfig,
    /// Flat interval used instead of the curve under a `slow` directive.
    pub slow_interval: Duration,
}

impl RespawnPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_max_respawns(mut self, max_respawns: u32) -> Self {
        self.max_respawns = max_respawns;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub const fn with_slow_interval(mut self, slow_interval: Duration) -> Self {
        self.slow_interval = slow_interval;
        self
    }
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            max_respawns: DEFAULT_MAX_RESPAWNS,
            backoff: BackoffConfig::default(),
            slow_interval: DEFAULT_SLOW_INTERVAL,
        }
    }
}

/// Per-exit overrides attached to one respawn decision.
///
/// The two knobs are independent: a respawn can be unlimited but paced by
/// the normal curve, capped but slow, both, or neither.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RespawnDirective {
    /// Ignore the attempt cap.
    pub unlimited: bool,
    /// Use the flat slow interval instead of the backoff curve.
    pub slow: bool,
}

impl RespawnDirective {
    pub const NORMAL: Self = Self {
        unlimited: false,
        slow: false,
    };

    #[must_use]
    pub const fn unlimited_slow() -> Self {
        Self {
            unlimited: true,
            slow: true,
        }
    }
}

/// Consecutive-failure counter for one process record.
#[derive(Debug, Clone)]
pub struct RespawnTracker {
    policy: RespawnPolicy,
    count: u32,
}

impl RespawnTracker {
    #[must_use]
    pub const fn new(policy: RespawnPolicy) -> Self {
        Self { policy, count: 0 }
    }

    /// Consecutive attempts since the last reset.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Whether another attempt is permitted under `directive`.
    #[must_use]
    pub const fn permits(&self, directive: RespawnDirective) -> bool {
        directive.unlimited || self.count < self.policy.max_respawns
    }

    /// Record one attempt and return the delay to wait before it.
    pub fn record_attempt(&mut self, directive: RespawnDirective) -> Duration {
        self.count = self.count.saturating_add(1);
        if directive.slow {
            self.policy.slow_interval
        } else {
            self.policy.backoff.delay_for_attempt(self.count)
        }
    }

    /// Reset the counter. Called when the child proves healthy by
    /// authenticating on the control socket.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}
