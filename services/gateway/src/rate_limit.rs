use crate::error::AppError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;
use types::ids::UserId;

/// Token bucket parameters for one kind of request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    pub scope: &'static str,
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
}

impl Quota {
    pub const READS: Quota = Quota {
        scope: "reads",
        capacity: 120,
        refill_rate: 2.0,
    };
    pub const WRITES: Quota = Quota {
        scope: "writes",
        capacity: 30,
        refill_rate: 0.5,
    };
    pub const WS_CONNECTIONS: Quota = Quota {
        scope: "ws_connections",
        capacity: 10,
        refill_rate: 0.2,
    };
    pub const WS_SUBSCRIPTIONS: Quota = Quota {
        scope: "ws_subscriptions",
        capacity: 50,
        refill_rate: 5.0,
    };
}

#[derive(Clone)]
struct Bucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64,
    last_update: Instant,
}

impl Bucket {
    fn new(quota: Quota, now: Instant) -> Self {
        Self {
            capacity: quota.capacity,
            tokens: quota.capacity as f64,
            refill_rate: quota.refill_rate,
            last_update: now,
        }
    }

    fn allow_request(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();

        self.tokens = f64::min(self.capacity as f64, self.tokens + elapsed * self.refill_rate);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// A full bucket behaves exactly like a fresh one.
    fn is_full_at(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens + elapsed * self.refill_rate >= self.capacity as f64
    }
}

/// Checks between sweeps of refilled buckets.
const SWEEP_INTERVAL: u64 = 1024;

/// Per-user request budgets, keyed by `user:scope`.
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, user_id: &UserId, quota: Quota) -> Result<(), AppError> {
        self.check_at(user_id, quota, Instant::now())
    }

    fn check_at(&self, user_id: &UserId, quota: Quota, now: Instant) -> Result<(), AppError> {
        let key = format!("{}:{}", user_id, quota.scope);
        let allowed = self
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(quota, now))
            .allow_request(now);

        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep(now);
        }

        if allowed {
            Ok(())
        } else {
            Err(AppError::RateLimitExceeded(format!(
                "{} budget exhausted for user {}",
                quota.scope, user_id
            )))
        }
    }

    /// Drop buckets that have refilled completely.
    fn sweep(&self, now: Instant) {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full_at(now));
        debug!(
            removed = before.saturating_sub(self.buckets.len()),
            "Swept idle rate-limit buckets"
        );
    }
}
