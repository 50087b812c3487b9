//! Transfer speed measurement.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Window over which the instantaneous speed is computed.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Sliding-window byte counter yielding instantaneous and mean speeds.
pub struct SpeedController {
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
    total_bytes: u64,
    started: Option<Instant>,
}

impl SpeedController {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            window_bytes: 0,
            total_bytes: 0,
            started: None,
        }
    }

    /// Record `bytes` of progress at `now` and return the speed in
    /// bytes/second over the recent window.
    pub fn calculate_speed(&mut self, now: Instant, bytes: u64) -> u64 {
        self.started.get_or_insert(now);
        if bytes > 0 {
            self.samples.push_back((now, bytes));
            self.window_bytes += bytes;
            self.total_bytes += bytes;
        }
        while let Some(&(t, b)) = self.samples.front() {
            if now.duration_since(t) <= SPEED_WINDOW {
                break;
            }
            self.window_bytes -= b;
            self.samples.pop_front();
        }
        let span = self
            .samples
            .front()
            .map(|&(t, _)| now.duration_since(t))
            .unwrap_or_default()
            .max(Duration::from_millis(100));
        (self.window_bytes as f64 / span.as_secs_f64()) as u64
    }

    /// Average speed over the whole life of the transfer.
    pub fn mean_speed(&self, now: Instant) -> u64 {
        match self.started {
            Some(t0) => {
                let span = now.duration_since(t0).max(Duration::from_millis(100));
                (self.total_bytes as f64 / span.as_secs_f64()) as u64
            }
            None => 0,
        }
    }
}

impl Default for SpeedController {
    fn default() -> Self {
        Self::new()
    }
}
