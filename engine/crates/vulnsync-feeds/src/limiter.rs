//! Call-rate limiting for feed downloads
//!
//! A GCRA bucket admitting `max_calls` requests per `period`, with bursts of
//! up to `max_calls`. Callers wait for capacity instead of failing. The clock
//! is pluggable so tests can drive time by hand.

use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock, FakeRelativeClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use vulnsync_core::{Error, Result};

/// A governor clock that can also wait
#[async_trait]
pub trait WaitClock: Clock + Send + Sync + 'static {
    /// Let `duration` pass on this clock
    async fn wait(&self, duration: Duration);
}

#[async_trait]
impl WaitClock for DefaultClock {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[async_trait]
impl WaitClock for FakeRelativeClock {
    async fn wait(&self, duration: Duration) {
        self.advance(duration);
    }
}

type DirectLimiter<C> =
    RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Rate limiter shared by every request of a [`crate::FeedClient`]
pub struct FetchLimiter<C: WaitClock = DefaultClock> {
    limiter: DirectLimiter<C>,
    clock: C,
}

impl FetchLimiter<DefaultClock> {
    pub fn new(max_calls: u32, period: Duration) -> Result<Self> {
        Self::with_clock(max_calls, period, DefaultClock::default())
    }
}

impl<C: WaitClock> FetchLimiter<C> {
    pub fn with_clock(max_calls: u32, period: Duration, clock: C) -> Result<Self> {
        let burst = NonZeroU32::new(max_calls).ok_or_else(|| Error::InvalidConfig {
            key: String::from("fetch.max_calls"),
            message: String::from("must be positive"),
        })?;
        let quota = Quota::with_period(period / max_calls)
            .ok_or_else(|| Error::InvalidConfig {
                key: String::from("fetch.period_secs"),
                message: String::from("must be positive"),
            })?
            .allow_burst(burst);

        Ok(Self {
            limiter: RateLimiter::direct_with_clock(quota, &clock),
            clock,
        })
    }

    /// Wait until a call is admitted; returns the time spent waiting
    pub async fn acquire(&self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            match self.limiter.check() {
                Ok(()) => return waited,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    tracing::debug!(
                        wait_ms = wait.as_millis() as u64,
                        "Rate limit reached, waiting"
                    );
                    self.clock.wait(wait).await;
                    waited += wait;
                }
            }
        }
    }

    /// Let `duration` pass on the limiter's clock
    pub async fn sleep(&self, duration: Duration) {
        self.clock.wait(duration).await;
    }
}
