use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::domain::UserId;

// ============== Authorization ==============

/// An empty allowlist means the bot is public.
pub fn is_authorized(user_id: Option<UserId>, allowed_users: &[i64]) -> bool {
    match user_id {
        Some(user) => allowed_users.is_empty() || allowed_users.contains(&user.0),
        None => false,
    }
}

pub fn is_admin(user_id: UserId, admins: &[i64]) -> bool {
    admins.contains(&user_id.0)
}

// ============== Rate Limiter (Token Bucket) ==============

#[derive(Clone, Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Per-user token bucket guarding the expensive paths (chat and voice).
#[derive(Clone, Debug)]
pub struct RateLimiter {
    enabled: bool,
    capacity: f64,
    refill_per_sec: f64,
    buckets: HashMap<UserId, Bucket>,
}

impl RateLimiter {
    pub fn new(enabled: bool, max_requests: u32, window: Duration) -> Self {
        let capacity = f64::from(max_requests);
        Self {
            enabled,
            capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(1e-9),
            buckets: HashMap::new(),
        }
    }

    /// Returns `Err(retry_after)` when the user is over the limit.
    pub fn check(&mut self, user_id: UserId) -> Result<(), Duration> {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&mut self, user_id: UserId, now: Instant) -> Result<(), Duration> {
        if !self.enabled {
            return Ok(());
        }

        let capacity = self.capacity;
        let bucket = self.buckets.entry(user_id).or_insert(Bucket {
            tokens: capacity,
            refilled_at: now,
        });

        let elapsed = now.saturating_duration_since(bucket.refilled_at);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        if self.refill_per_sec <= 0.0 {
            return Err(Duration::MAX);
        }
        let wait = (1.0 - bucket.tokens) / self.refill_per_sec;
        Err(Duration::from_secs_f64(wait.max(0.0)))
    }
}
