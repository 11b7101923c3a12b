//! Token-bucket admission control in front of `update` retrievals.
//!
//! Grounded on the teacher crate's `networking::loadbalancer::traffic_shaping::RateLimiter`,
//! simplified to the single knob this service needs: one shared bucket with
//! rate `R` tokens/second and burst capacity `B`.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};

pub struct AdmissionController {
    capacity: f64,
    refill_rate: f64,
    tokens: Mutex<f64>,
    last_refill: Mutex<Instant>,
    denied_total: AtomicU64,
}

impl AdmissionController {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self {
            capacity: burst as f64,
            refill_rate: rate_per_second,
            tokens: Mutex::new(burst as f64),
            last_refill: Mutex::new(Instant::now()),
            denied_total: AtomicU64::new(0),
        }
    }

    /// Consumes one token. Fails with `TooManyRequests` when the bucket is
    /// empty; callers never queue (§4.6).
    pub async fn admit(&self) -> Result<()> {
        let now = Instant::now();
        let mut tokens = self.tokens.lock().await;
        let mut last_refill = self.last_refill.lock().await;

        let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
        if elapsed > 0.0 {
            *tokens = (*tokens + elapsed * self.refill_rate).min(self.capacity);
            *last_refill = now;
        }

        if *tokens >= 1.0 {
            *tokens -= 1.0;
            Ok(())
        } else {
            self.denied_total.fetch_add(1, Ordering::Relaxed);
            Err(Error::TooManyRequests)
        }
    }

    pub fn denied_total(&self) -> u64 {
        self.denied_total.load(Ordering::Relaxed)
    }
}
