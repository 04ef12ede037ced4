//! Sliding-window throughput meter.
//!
//! Grounded on `original_source/shield/bandwidth.py::BandwidthMonitor`: a
//! deque of `(timestamp, bytes)` samples, expired lazily on read so the cost
//! of `speed_mbps` is proportional to the number of samples that actually
//! fell out of the window, not the window's width.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

struct WindowState {
    samples: VecDeque<(Instant, u64)>,
    sum_bytes: u64,
}

/// Throughput over a fixed trailing window `W` seconds wide.
pub struct SlidingWindowMeter {
    window_secs: f64,
    state: Mutex<WindowState>,
}

impl SlidingWindowMeter {
    pub fn new(window_secs: f64) -> Self {
        SlidingWindowMeter {
            window_secs,
            state: Mutex::new(WindowState {
                samples: VecDeque::new(),
                sum_bytes: 0,
            }),
        }
    }

    /// Records `n` bytes observed now.
    pub fn add_sample(&self, n: u64) {
        let mut state = self.state.lock().expect("sliding window mutex poisoned");
        let now = Instant::now();
        state.samples.push_back((now, n));
        state.sum_bytes += n;
        self.expire(&mut state, now);
    }

    /// Current throughput in megabytes per second over the last `window_secs`.
    pub fn speed_mbps(&self) -> f64 {
        let mut state = self.state.lock().expect("sliding window mutex poisoned");
        let now = Instant::now();
        self.expire(&mut state, now);
        (state.sum_bytes as f64) / self.window_secs / 1_048_576.0
    }

    /// Number of samples currently inside the window.
    pub fn sample_count(&self) -> usize {
        let mut state = self.state.lock().expect("sliding window mutex poisoned");
        let now = Instant::now();
        self.expire(&mut state, now);
        state.samples.len()
    }

    /// Drops all recorded samples.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("sliding window mutex poisoned");
        state.samples.clear();
        state.sum_bytes = 0;
    }

    /// Removes samples older than `now - window_secs` from the head, O(k)
    /// in the number expired.
    fn expire(&self, state: &mut WindowState, now: Instant) {
        while let Some(&(ts, bytes)) = state.samples.front() {
            if now.duration_since(ts).as_secs_f64() > self.window_secs {
                state.samples.pop_front();
                state.sum_bytes = state.sum_bytes.saturating_sub(bytes);
            } else {
                break;
            }
        }
    }
}
