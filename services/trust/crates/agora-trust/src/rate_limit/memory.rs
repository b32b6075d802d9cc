//! Per-process sliding window.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{RateLimitDecision, RateLimitError, RateLimiter};

/// Smallest map size that triggers a sweep of idle buckets.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug)]
struct Window {
    length: Duration,
    hits: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) >= self.length {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug)]
struct Buckets {
    windows: HashMap<String, Window>,
    /// Next sweep runs once `windows` reaches this size: twice what the
    /// previous sweep kept, and never below the threshold.
    sweep_at: usize,
    floor: usize,
    sweeps: u64,
}

impl Buckets {
    fn sweep_if_due(&mut self, now: Instant) {
        if self.windows.len() < self.sweep_at {
            return;
        }
        self.windows.retain(|_, w| {
            w.prune(now);
            !w.hits.is_empty()
        });
        self.sweep_at = self.windows.len().saturating_mul(2).max(self.floor);
        self.sweeps += 1;
        tracing::debug!(kept = self.windows.len(), sweeps = self.sweeps, "idle rate limit buckets swept");
    }
}

/// In-memory limiter. Correct for one instance only.
#[derive(Debug)]
pub struct MemoryRateLimiter {
    buckets: Mutex<Buckets>,
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::with_sweep_threshold(SWEEP_THRESHOLD)
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

impl MemoryRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sweep_threshold(floor: usize) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                windows: HashMap::new(),
                sweep_at: floor,
                floor,
                sweeps: 0,
            }),
        }
    }

    fn check_at(&self, key: &str, limit: u32, window_seconds: u64, now: Instant) -> RateLimitDecision {
        if limit == 0 {
            return RateLimitDecision::deny(window_seconds);
        }
        let length = Duration::from_secs(window_seconds);

        let mut buckets = self.buckets.lock();
        buckets.sweep_if_due(now);
        let window = buckets.windows.entry(key.to_string()).or_insert_with(|| Window {
            length,
            hits: VecDeque::new(),
        });
        window.length = length;
        window.prune(now);

        if window.hits.len() < limit as usize {
            window.hits.push_back(now);
            return RateLimitDecision::allow();
        }

        let retry = window
            .hits
            .front()
            .map_or(window_seconds, |&oldest| {
                ceil_secs(length.saturating_sub(now.duration_since(oldest)))
            });
        RateLimitDecision::deny(retry)
    }

    /// Live entries in `key`'s bucket.
    #[must_use]
    pub fn recorded(&self, key: &str) -> usize {
        let now = Instant::now();
        self.buckets.lock().windows.get_mut(key).map_or(0, |w| {
            w.prune(now);
            w.hits.len()
        })
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        Ok(self.check_at(key, limit, window_seconds, Instant::now()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
