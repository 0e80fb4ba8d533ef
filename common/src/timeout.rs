use std::thread;
use std::time::{Duration, Instant};

/// Deadline for busy-waiting on a hardware condition.
pub struct Timeout {
    instant: Instant,
    duration: Duration,
}

impl Timeout {
    #[inline]
    pub fn new(duration: Duration) -> Self {
        Self {
            instant: Instant::now(),
            duration,
        }
    }

    #[inline]
    pub fn from_micros(micros: u64) -> Self {
        Self::new(Duration::from_micros(micros))
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    #[inline]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Yield once and report whether the deadline is still ahead.
    #[inline]
    pub fn run(&self) -> Result<(), ()> {
        if self.instant.elapsed() < self.duration {
            thread::yield_now();
            Ok(())
        } else {
            Err(())
        }
    }

    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.instant.elapsed())
    }
}

/// Poll `cond` up to `retries` times, sleeping `delay` between attempts.
pub fn poll_retries(retries: u32, delay: Duration, mut cond: impl FnMut() -> bool) -> Result<(), ()> {
    for _ in 0..retries {
        if cond() {
            return Ok(());
        }
        thread::sleep(delay);
    }
    if cond() {
        Ok(())
    } else {
        Err(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn poll_gives_up() {
        let mut calls = 0;
        assert!(poll_retries(3, Duration::from_micros(1), || {
            calls += 1;
            false
        })
        .is_err());
        assert_eq!(calls, 4);
    }

    #[test]
    fn poll_succeeds_late() {
        let mut calls = 0;
        assert!(poll_retries(5, Duration::from_micros(1), || {
            calls += 1;
            calls == 3
        })
        .is_ok());
    }

    #[test]
    fn timeout_expires() {
        let timeout = Timeout::from_micros(1);
        thread::sleep(Duration::from_millis(1));
        assert!(timeout.run().is_err());
        assert_eq!(timeout.remaining(), Duration::ZERO);
    }
}
