use chrono::Local;

/// Source of wall-clock epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Local::now().timestamp_millis()
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::Clock;

    pub struct ManualClock {
        now_ms: AtomicI64,
    }

    impl ManualClock {
        pub fn new(now_ms: i64) -> Self {
            Self {
                now_ms: AtomicI64::new(now_ms),
            }
        }

        pub fn set(&self, now_ms: i64) {
            self.now_ms.store(now_ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> i64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn system_clock_does_not_go_backwards_across_a_short_sleep() {
        let clock = SystemClock;
        let first = clock.now_ms();
        thread::sleep(Duration::from_millis(2));
        assert!(clock.now_ms() >= first);
    }
}
