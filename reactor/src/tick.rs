//! The reactor's periodic heartbeat.
//!
//! Every timeout in the system (liveness, connect watchdogs, worker job deadlines) is
//! expressed in ticks of this single timer rather than as independent wall-clock
//! deadlines, so the reactor only ever needs to track one upcoming wakeup.

use tunsock_common::{LocalDuration, LocalTime};

#[derive(Debug, Default)]
pub struct TickTimer {
    interval: Option<LocalDuration>,
    next: Option<LocalTime>,
}

impl TickTimer {
    /// Reprogram the interval. `None` disables ticking entirely.
    pub fn set_interval(&mut self, interval: Option<LocalDuration>, now: LocalTime) {
        self.interval = interval;
        self.next = interval.map(|d| now + d);
    }

    /// How long the reactor should block in its readiness wait before a tick is due.
    pub fn wait_timeout(&self, now: LocalTime) -> Option<LocalDuration> {
        self.next.map(|deadline| {
            if deadline <= now {
                LocalDuration::from_millis(0)
            } else {
                deadline - now
            }
        })
    }

    /// Called once per reactor iteration. Returns `true` at most once per iteration,
    /// even if multiple intervals have elapsed, and reschedules the next deadline.
    pub fn poll(&mut self, now: LocalTime) -> bool {
        match self.next {
            Some(deadline) if deadline <= now => {
                if let Some(interval) = self.interval {
                    self.next = Some(now + interval);
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_iteration() {
        let mut timer = TickTimer::default();
        let t0 = LocalTime::now();
        timer.set_interval(Some(LocalDuration::from_millis(100)), t0);

        let t1 = t0 + LocalDuration::from_millis(250);
        assert!(timer.poll(t1));
        assert!(!timer.poll(t1));
    }

    #[test]
    fn disabled_interval_never_fires() {
        let mut timer = TickTimer::default();
        timer.set_interval(None, LocalTime::now());
        assert!(timer.wait_timeout(LocalTime::now()).is_none());
    }
}
