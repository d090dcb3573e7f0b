//! Sliding-window download speed measurement.
//!
//! Workers report byte counts into a [`SpeedSampler`] as they flush their
//! buffers; the task's progress loop advances the window once per progress
//! interval and reads the current speed. Until a full window of samples has
//! accumulated the speed is the cumulative average since the run started,
//! afterwards it is the average over the most recent window only, so stalls
//! and bursts show up within one window instead of being flattened by the
//! whole run's history.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Shared handle for recording and sampling download speed.
///
/// Cheap to clone; all clones feed the same window.
#[derive(Debug, Clone)]
pub struct SpeedSampler {
    window: Arc<Mutex<SpeedWindow>>,
}

impl SpeedSampler {
    /// Creates a sampler whose window spans `window`, sampled every `tick`.
    #[must_use]
    pub fn new(window: Duration, tick: Duration) -> Self {
        let tick_ms = tick.as_millis().max(1) as u64;
        let slots = (window.as_millis() as u64).div_ceil(tick_ms).max(1) as usize;
        Self {
            window: Arc::new(Mutex::new(SpeedWindow::new(slots, tick_ms))),
        }
    }

    /// Records bytes received since the last call. Called from worker tasks.
    pub fn record(&self, bytes: u64) {
        self.lock().record(bytes);
    }

    /// Advances the window by one tick and returns the speed in bytes per
    /// second. Called once per progress interval.
    pub fn tick_and_speed(&self) -> u64 {
        let mut window = self.lock();
        window.tick();
        window.speed()
    }

    /// Total bytes recorded since the sampler was created.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.lock().total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpeedWindow> {
        // A panic while holding this lock cannot leave the counters in a
        // partial state, so a poisoned guard is still usable.
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct SpeedWindow {
    slots: Vec<u64>,
    cursor: usize,
    /// Ticks elapsed since the sampler started.
    ticks: u64,
    /// Cumulative bytes since the sampler started.
    total: u64,
    tick_ms: u64,
}

impl SpeedWindow {
    fn new(slots: usize, tick_ms: u64) -> Self {
        Self {
            slots: vec![0; slots],
            cursor: 0,
            ticks: 0,
            total: 0,
            tick_ms,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.slots[self.cursor] += bytes;
        self.total += bytes;
    }

    fn tick(&mut self) {
        self.ticks += 1;
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.slots[self.cursor] = 0;
    }

    fn speed(&self) -> u64 {
        if self.ticks < self.slots.len() as u64 {
            let elapsed_ms = self.ticks.max(1) * self.tick_ms;
            self.total.saturating_mul(1000) / elapsed_ms
        } else {
            let window_ms = self.slots.len() as u64 * self.tick_ms;
            let sum: u64 = self.slots.iter().sum();
            sum.saturating_mul(1000) / window_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(window_secs: u64, tick_secs: u64) -> SpeedSampler {
        SpeedSampler::new(
            Duration::from_secs(window_secs),
            Duration::from_secs(tick_secs),
        )
    }

    #[test]
    fn test_speed_is_cumulative_average_before_window_fills() {
        let sampler = sampler(10, 1);
        sampler.record(3000);
        assert_eq!(sampler.tick_and_speed(), 3000);

        // 3000 bytes over 2 seconds.
        assert_eq!(sampler.tick_and_speed(), 1500);
    }

    #[test]
    fn test_speed_uses_window_once_filled() {
        let sampler = sampler(4, 1);
        // 1000 B/s for four ticks fills the window.
        let mut speed = 0;
        for _ in 0..4 {
            sampler.record(1000);
            speed = sampler.tick_and_speed();
        }
        // The fourth tick already rotated the oldest slot out.
        assert_eq!(speed, 750);
        // A silent tick drops another slot out of the window.
        assert_eq!(sampler.tick_and_speed(), 500);
    }

    #[test]
    fn test_stall_decays_to_zero_within_one_window() {
        let sampler = sampler(3, 1);
        for _ in 0..3 {
            sampler.record(900);
            sampler.tick_and_speed();
        }
        sampler.tick_and_speed();
        sampler.tick_and_speed();
        assert_eq!(sampler.tick_and_speed(), 0);
    }

    #[test]
    fn test_total_bytes_accumulates_across_window_turnover() {
        let sampler = sampler(2, 1);
        for _ in 0..10 {
            sampler.record(100);
            sampler.tick_and_speed();
        }
        assert_eq!(sampler.total_bytes(), 1000);
    }

    #[test]
    fn test_zero_bytes_reports_zero_speed() {
        let sampler = sampler(10, 1);
        assert_eq!(sampler.tick_and_speed(), 0);
    }

    #[test]
    fn test_subsecond_tick() {
        let sampler = SpeedSampler::new(Duration::from_secs(1), Duration::from_millis(250));
        sampler.record(250);
        // 250 bytes in the first 250 ms tick is 1000 B/s.
        assert_eq!(sampler.tick_and_speed(), 1000);
    }
}
