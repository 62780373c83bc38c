//! Per-action token buckets.
//!
//! Buckets are created lazily on first use and live as long as the limiter.
//! State is host-local; nothing is shared across processes.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Admission {
    pub ok: bool,
    /// Milliseconds until one token is available; absent when admitted or
    /// when the bucket can never refill.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl Admission {
    fn granted() -> Self {
        Self {
            ok: true,
            retry_after_ms: None,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    /// Refill rate in tokens per second.
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn new(rate: f64, now: Instant) -> Self {
        Self {
            rate,
            tokens: capacity(rate),
            last: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + dt * self.rate).min(capacity(self.rate));
        self.last = now;
    }
}

/// Burst size. Rates below one per second still admit a single call.
fn capacity(rate: f64) -> f64 {
    rate.max(1.0)
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one token from `name`'s bucket, creating it at `rate` on first use.
    pub fn allow(&self, name: &str, rate: f64) -> Admission {
        self.allow_at(name, rate, Instant::now())
    }

    pub fn allow_at(&self, name: &str, rate: f64, now: Instant) -> Admission {
        if !rate.is_finite() || rate <= 0.0 {
            return Admission {
                ok: false,
                retry_after_ms: None,
            };
        }
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(name.to_string())
            .or_insert_with(|| Bucket::new(rate, now));
        bucket.refill(now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Admission::granted();
        }
        let needed = 1.0 - bucket.tokens;
        let wait_ms = (needed / bucket.rate * 1000.0).ceil() as u64;
        Admission {
            ok: false,
            retry_after_ms: Some(wait_ms.max(1)),
        }
    }

    /// Changes the refill rate of `name`, creating a full bucket if absent.
    pub fn set_rate(&self, name: &str, rate: f64) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(name) {
            Some(bucket) => {
                bucket.refill(now);
                bucket.rate = rate;
                bucket.tokens = bucket.tokens.min(capacity(rate));
            }
            None => {
                buckets.insert(name.to_string(), Bucket::new(rate, now));
            }
        }
    }

    pub fn reset(&self) {
        self.buckets.lock().clear();
    }
}
