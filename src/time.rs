use embedded_time::{Clock, Instant, clock, rate::Fraction};

use crate::client::Config;

/// `embedded-time` view of the embassy time driver, counting microseconds
/// from creation.
#[derive(Clone, Copy, Debug)]
pub struct EmbassyClock {
    start: embassy_time::Instant,
}

impl EmbassyClock {
    pub fn new() -> Self {
        Self {
            start: embassy_time::Instant::now(),
        }
    }
}

impl Default for EmbassyClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for EmbassyClock {
    type T = u64;

    const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000_000);

    fn try_now(&self) -> Result<Instant<Self>, clock::Error> {
        let elapsed = embassy_time::Instant::now().duration_since(self.start);

        Ok(Instant::new(elapsed.as_micros()))
    }
}

/// Polling period for [`crate::Client::run_timers`]: a quarter of the retry
/// interval, at least 100 ms.
pub fn timer_period(config: &Config) -> embassy_time::Duration {
    embassy_time::Duration::from_millis(u64::from(config.retry_interval_ms / 4).max(100))
}
