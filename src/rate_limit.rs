use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window in-memory rate limiter (pod local). Keeps mass-submitted
/// spam from reaching the classifier at all.
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { store: Arc::new(DashMap::new()), enabled }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled {
            return true;
        }
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Per-IP submission throttle with env-tunable limits.
#[derive(Clone)]
pub struct SubmissionLimiter {
    limiter: InMemoryRateLimiter,
    limit: usize,
    window: Duration,
}

impl SubmissionLimiter {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize {
            std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        fn dur_env(name: &str, default: u64) -> Duration {
            Duration::from_secs(std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
        }
        let enabled = std::env::var("RL_DISABLED").map(|v| v != "1").unwrap_or(true);
        Self {
            limiter: InMemoryRateLimiter::new(enabled),
            limit: usize_env("RL_SUBMISSION_LIMIT", 10),
            window: dur_env("RL_SUBMISSION_WINDOW", 3600),
        }
    }

    pub fn allow_submission(&self, ip: &str) -> bool {
        self.limiter.check(&format!("bug_report_submission:{ip}"), self.limit, self.window)
    }
}
