// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Bandwidth cap shared by every fetch loop of a registry.
///
/// Implemented as a token bucket holding at most one second worth of bytes.
/// A rate of 0 disables throttling.
#[derive(Clone, Debug)]
pub struct SpeedLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    /// Bytes per second; also the burst size.
    rate: u64,
    available: u64,
    refilled_at: Instant,
}

impl SpeedLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                rate: bytes_per_sec,
                available: bytes_per_sec,
                refilled_at: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub async fn rate(&self) -> u64 {
        self.bucket.lock().await.rate
    }

    /// Changes the cap; the bucket starts full at the new rate.
    pub async fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock().await;
        bucket.rate = bytes_per_sec;
        bucket.available = bytes_per_sec;
        bucket.refilled_at = Instant::now();
    }

    /// Waits until `amount` bytes may be written.
    ///
    /// Requests larger than the burst size are granted once the bucket is
    /// full, which lets a chunk bigger than the rate through once per second.
    pub async fn take(&self, amount: u64) {
        if amount == 0 {
            return;
        }

        loop {
            let mut bucket = self.bucket.lock().await;
            if bucket.rate == 0 {
                return;
            }
            bucket.refill();

            let needed = amount.min(bucket.rate);
            if bucket.available >= needed {
                bucket.available -= needed;
                return;
            }

            let missing = needed - bucket.available;
            let wait = Duration::from_secs_f64(missing as f64 / bucket.rate as f64);
            // release before sleeping so other loops can refill/take
            drop(bucket);
            tokio::time::sleep(wait).await;
        }
    }
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let earned = (now.duration_since(self.refilled_at).as_secs_f64() * self.rate as f64) as u64;
        if earned > 0 {
            self.available = (self.available + earned).min(self.rate);
            self.refilled_at = now;
        }
    }
}
