//! Time source abstraction for timeout-bearing state machines.
//!
//! Everything in the daemon that sleeps or measures elapsed time goes
//! through a [`Clock`] rather than calling `tokio::time` directly. The
//! production implementation is [`TokioClock`]; tests run under
//! `#[tokio::test(start_paused = true)]` and drive the same clock with
//! virtual time, so grace windows and backoff delays are tested without
//! wall-clock waits.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;

/// A source of now-and-sleep used by the supervisor and record actors.
pub trait Clock: Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Sleep for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// The tokio runtime clock. Respects paused virtual time under test.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn paused_time_advances_through_sleep() {
        let clock = TokioClock;
        let before = clock.now();
        clock.sleep(Duration::from_secs(3600)).await;
        assert!(clock.now() - before >= Duration::from_secs(3600));
    }
}
