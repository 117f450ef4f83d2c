use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::Level;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Rate-limited counter for non-fatal anomalies.
///
/// Increments are cheap; the counter is flushed to the `log` facade at most
/// once per interval, aggregating everything recorded since the last flush.
pub struct LogCounter {
    level: Level,
    text: &'static str,
    count: AtomicUsize,
    last_flush: Mutex<Option<Instant>>,
}

impl LogCounter {
    pub const fn new(level: Level, text: &'static str) -> Self {
        Self {
            level,
            text,
            count: AtomicUsize::new(0),
            last_flush: Mutex::new(None),
        }
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.try_flush();
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn try_flush(&self) {
        let now = Instant::now();
        let mut last = match self.last_flush.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *last {
            Some(at) if now.duration_since(at) < FLUSH_INTERVAL => {}
            _ => {
                *last = Some(now);
                let n = self.count.swap(0, Ordering::Relaxed);
                if n > 0 {
                    log::log!(self.level, "{}: {}", self.text, n);
                }
            }
        }
    }
}
