use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug)]
struct ByteSample {
    bytes: u64,
    instant: Instant,
}

/// Bytes-per-second over a trailing time window.
///
/// Samples older than the window are evicted, so the rate decays to zero once
/// there is no activity for a whole window.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window: Duration,
    samples: VecDeque<ByteSample>,
    in_window: u64,
    total: u64,
}

impl RateWindow {
    pub fn new(window: Duration) -> anyhow::Result<Self> {
        if window.is_zero() {
            anyhow::bail!("rate window can't be zero");
        }
        Ok(Self {
            window,
            samples: VecDeque::new(),
            in_window: 0,
            total: 0,
        })
    }

    pub fn add(&mut self, bytes: u64, instant: Instant) {
        self.total += bytes;
        self.in_window += bytes;
        self.samples.push_back(ByteSample { bytes, instant });
        self.evict(instant);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(first) = self.samples.front() {
            if now.saturating_duration_since(first.instant) <= self.window {
                break;
            }
            self.in_window -= first.bytes;
            self.samples.pop_front();
        }
    }

    pub fn bps(&mut self, now: Instant) -> u64 {
        self.evict(now);
        (self.in_window as f64 / self.window.as_secs_f64()) as u64
    }

    /// Everything ever added, regardless of the window.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }
}
