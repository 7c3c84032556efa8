use embedded_time::{Instant, duration, rate};

pub(crate) struct KeepAlive<C: embedded_time::Clock> {
    keep_alive: duration::Generic<C::T>,
    half_keep_alive: duration::Generic<C::T>,
    last_send: Instant<C>,
    ping_sent_at: Option<Instant<C>>,
    enabled: bool,
}

impl<C> KeepAlive<C>
where
    C: embedded_time::Clock,
{
    /// `seconds` is the keep-alive announced in CONNECT, 0 disables it.
    pub(crate) fn new(now: Instant<C>, seconds: u16) -> Self {
        let keep_alive = duration::Generic::new(
            C::T::from(u32::from(seconds)),
            rate::Fraction::new(1, 1),
        );
        let half_keep_alive = duration::Generic::new(
            C::T::from(u32::from(seconds)),
            rate::Fraction::new(1, 2),
        );

        Self {
            keep_alive,
            half_keep_alive,
            last_send: now,
            ping_sent_at: None,
            enabled: seconds != 0,
        }
    }

    pub(crate) fn on_send(&mut self, now: Instant<C>) {
        self.last_send = now;
    }

    pub(crate) fn on_receive(&mut self) {
        self.ping_sent_at = None;
    }

    /// Marks the ping as sent when it returns true.
    pub(crate) fn should_ping(&mut self, now: Instant<C>) -> bool {
        if !self.enabled || self.ping_sent_at.is_some() {
            return false;
        }

        if elapsed(now, self.last_send) >= Some(self.half_keep_alive) {
            self.ping_sent_at = Some(now);
            true
        } else {
            false
        }
    }

    pub(crate) fn timed_out(&self, now: Instant<C>) -> bool {
        match self.ping_sent_at {
            Some(sent_at) if self.enabled => elapsed(now, sent_at) >= Some(self.keep_alive),
            _ => false,
        }
    }
}

fn elapsed<C: embedded_time::Clock>(
    now: Instant<C>,
    since: Instant<C>,
) -> Option<duration::Generic<C::T>> {
    now.checked_duration_since(&since)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::MockClock;

    fn at(ms: u64) -> Instant<MockClock> {
        Instant::new(ms)
    }

    #[test]
    fn pings_after_half_interval_without_sends() {
        let mut keep_alive = KeepAlive::<MockClock>::new(at(0), 10);

        assert!(!keep_alive.should_ping(at(4_999)));
        keep_alive.on_send(at(3_000));
        assert!(!keep_alive.should_ping(at(7_999)));
        assert!(keep_alive.should_ping(at(8_000)));
        // one ping at a time
        assert!(!keep_alive.should_ping(at(20_000)));
    }

    #[test]
    fn times_out_without_inbound_traffic_after_ping() {
        let mut keep_alive = KeepAlive::<MockClock>::new(at(0), 10);
        assert!(keep_alive.should_ping(at(5_000)));

        assert!(!keep_alive.timed_out(at(14_999)));
        assert!(keep_alive.timed_out(at(15_000)));

        keep_alive.on_receive();
        assert!(!keep_alive.timed_out(at(15_000)));
        // the next ping waits for half an interval after the last send
        keep_alive.on_send(at(15_000));
        assert!(!keep_alive.should_ping(at(19_999)));
        assert!(keep_alive.should_ping(at(20_000)));
    }

    #[test]
    fn zero_disables() {
        let mut keep_alive = KeepAlive::<MockClock>::new(at(0), 0);

        assert!(!keep_alive.should_ping(at(1_000_000)));
        assert!(!keep_alive.timed_out(at(1_000_000)));
    }
}
