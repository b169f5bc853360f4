//! In-process rate limiters. Both are process-scoped singletons held in
//! `AppState`; their maps are mutex-guarded and bounded.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hubex_shared::ids::DeviceId;

/// Opportunistic sweep threshold: once the map grows past this many
/// devices, expired entries are dropped on the next check.
const SWEEP_THRESHOLD: usize = 1024;

/// Per-device sliding window over event timestamps, used for telemetry
/// ingest. The deque for a device is trimmed on every access, so entries
/// age out without a timer.
pub struct SlidingWindowLimiter {
    window: Duration,
    max_events: usize,
    hits: Mutex<HashMap<DeviceId, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            window,
            max_events,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(max_events: usize) -> Self {
        Self::new(max_events, Duration::from_secs(60))
    }

    /// Record one event for the device. Returns false when the device has
    /// already used up its window.
    pub fn check_and_record(&self, device_id: DeviceId) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("rate limiter lock poisoned");

        if hits.len() > SWEEP_THRESHOLD {
            let window = self.window;
            hits.retain(|_, deque| {
                while deque
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    deque.pop_front();
                }
                !deque.is_empty()
            });
        }

        let deque = hits.entry(device_id).or_default();
        while deque
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            deque.pop_front();
        }
        if deque.len() >= self.max_events {
            return false;
        }
        deque.push_back(now);
        true
    }

    /// Seconds until the oldest recorded event leaves the window.
    pub fn retry_after_seconds(&self, device_id: DeviceId) -> u64 {
        let hits = self.hits.lock().expect("rate limiter lock poisoned");
        hits.get(&device_id)
            .and_then(|deque| deque.front())
            .map(|oldest| {
                self.window
                    .saturating_sub(oldest.elapsed())
                    .as_secs()
                    .max(1)
            })
            .unwrap_or(1)
    }
}

/// Fixed-window counter keyed by an opaque string, used for the per-user
/// request limit. Windows are aligned to wall-clock boundaries.
pub struct FixedWindowLimiter {
    state: Mutex<HashMap<String, (u64, u32)>>,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `(allowed, retry_after_seconds)` for one request against
    /// `limit` per `window_seconds`.
    pub fn allow(&self, key: &str, limit: u32, window_seconds: u64) -> (bool, u64) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_secs();
        let window_start = now - (now % window_seconds);
        let remaining = window_seconds - (now - window_start);

        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        // Stale windows from other keys are dropped here so the map stays
        // bounded by the set of keys active in the current window.
        if state.len() > SWEEP_THRESHOLD {
            state.retain(|_, (start, _)| *start == window_start);
        }
        match state.get_mut(key) {
            Some((start, count)) if *start == window_start => {
                if *count >= limit {
                    (false, remaining)
                } else {
                    *count += 1;
                    (true, remaining)
                }
            }
            _ => {
                state.insert(key.to_string(), (window_start, 1));
                (true, remaining)
            }
        }
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}
