//! Token bucket limiting reconciliation frequency, burst of one.

use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};

pub struct RateLimiter {
    interval: Duration,
    next_free: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `qps` below or equal to zero disables limiting.
    pub fn new(qps: f32) -> Self {
        let interval = if qps > 0.0 {
            Duration::from_secs_f32(1.0 / qps)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next_free: Mutex::new(None),
        }
    }

    /// Blocks until a token is available.
    pub async fn accept(&self) {
        if self.interval.is_zero() {
            return;
        }

        let mut next_free = self.next_free.lock().await;
        let now = Instant::now();
        match *next_free {
            Some(at) if at > now => {
                *next_free = Some(at + self.interval);
                tokio::time::sleep_until(at).await;
            },
            _ => {
                *next_free = Some(now + self.interval);
            },
        }
    }
}
