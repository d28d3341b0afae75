use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Sliding-window rate limiter keyed by named windows, so one limiter can
/// back both the global per-IP limit and the stricter `/api/auth/*` limit.
pub struct RateLimiter {
    windows: Mutex<HashMap<&'static str, HashMap<String, VecDeque<Instant>>>>,
}

pub struct Limit {
    pub max_requests: usize,
    pub window: Duration,
}

pub const GLOBAL: (&str, Limit) = (
    "global",
    Limit { max_requests: 200, window: Duration::from_secs(15 * 60) },
);
pub const AUTH: (&str, Limit) = (
    "auth",
    Limit { max_requests: 20, window: Duration::from_secs(15 * 60) },
);

impl RateLimiter {
    pub fn new() -> Self {
        Self { windows: Mutex::new(HashMap::new()) }
    }

    /// Returns Ok(()) if allowed, Err with seconds until the next free slot.
    pub async fn check(&self, (name, limit): (&'static str, &Limit), key: &str) -> Result<(), u64> {
        let mut windows = self.windows.lock().await;
        let map = windows.entry(name).or_default();
        let now = Instant::now();
        let entry = map.entry(key.to_string()).or_default();

        while entry.front().is_some_and(|t| now.duration_since(*t) > limit.window) {
            entry.pop_front();
        }

        if entry.len() >= limit.max_requests {
            let oldest = *entry.front().unwrap();
            let retry_after = limit.window.as_secs().saturating_sub(now.duration_since(oldest).as_secs());
            return Err(retry_after.max(1));
        }

        entry.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocks_after_max_requests() {
        let rl = RateLimiter::new();
        let small = ("t", Limit { max_requests: 2, window: Duration::from_secs(60) });
        assert!(rl.check((small.0, &small.1), "ip1").await.is_ok());
        assert!(rl.check((small.0, &small.1), "ip1").await.is_ok());
        assert!(rl.check((small.0, &small.1), "ip1").await.is_err());
        // different key is independent
        assert!(rl.check((small.0, &small.1), "ip2").await.is_ok());
    }
}
