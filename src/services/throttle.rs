use std::time::{Duration, Instant};

/// Rate limiter for progress logging inside polling loops.
///
/// `ready` returns true at most once per `interval`; the first call always passes.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_passes() {
        let mut throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.ready());
        assert!(!throttle.ready());
    }

    #[test]
    fn passes_again_after_interval() {
        let mut throttle = LogThrottle::new(Duration::from_millis(20));
        assert!(throttle.ready());
        assert!(!throttle.ready());
        std::thread::sleep(Duration::from_millis(30));
        assert!(throttle.ready());
    }

    #[test]
    fn zero_interval_always_passes() {
        let mut throttle = LogThrottle::new(Duration::ZERO);
        assert!(throttle.ready());
        assert!(throttle.ready());
    }
}
