use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// What happens when a user's bucket is empty.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// Log the rejection and call the grader anyway.
    Advisory,
    /// Skip the external grader and score with the fallback heuristic.
    Enforce,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterSettings {
    pub capacity: u32,
    pub refill_per_sec: u32,
    pub initial_tokens: u32,
    pub policy: RateLimitPolicy,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 1,
            initial_tokens: 5,
            policy: RateLimitPolicy::Advisory,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Per-user in-memory token bucket. Process-local and reset on restart.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    settings: RateLimiterSettings,
}

impl RateLimiter {
    pub fn new(settings: RateLimiterSettings) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            settings,
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.settings.policy
    }

    pub fn try_consume(&self, user_id: &str) -> bool {
        self.try_consume_at(user_id, Instant::now(), 1)
    }

    /// Refills by whole elapsed seconds only; the fractional remainder
    /// carries over to the next call.
    pub fn try_consume_at(&self, user_id: &str, now: Instant, cost: u32) -> bool {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let bucket = buckets.entry(user_id.to_string()).or_insert(Bucket {
            tokens: self.settings.initial_tokens.min(self.settings.capacity),
            last_refill: now,
        });

        let elapsed_secs = now.saturating_duration_since(bucket.last_refill).as_secs();
        if elapsed_secs > 0 {
            let refill = elapsed_secs
                .saturating_mul(self.settings.refill_per_sec as u64)
                .min(self.settings.capacity as u64) as u32;
            bucket.tokens = bucket.tokens.saturating_add(refill).min(self.settings.capacity);
            bucket.last_refill += Duration::from_secs(elapsed_secs);
        }

        if bucket.tokens < cost {
            debug!(user_id = %user_id, tokens = bucket.tokens, "Token bucket empty");
            return false;
        }

        bucket.tokens -= cost;
        true
    }

    /// Tokens currently held for a user, without refilling.
    pub fn available_tokens(&self, user_id: &str) -> Option<u32> {
        let buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets.get(user_id).map(|b| b.tokens)
    }
}
