use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};

const MIN_PROVIDER_INTERVAL_MS: u64 = 50;

/// Enforces a minimum spacing between consecutive calls.
pub struct RateLimiter {
    min_interval_ms: AtomicU64,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    /// Provider-side limit expressed in requests per second.
    pub fn per_second(rps: u32) -> Self {
        Self::with_interval(Duration::from_millis(Self::interval_ms(rps)))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(interval.as_millis() as u64),
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn set_interval(&self, interval: Duration) {
        self.min_interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst))
    }

    pub fn rps(&self) -> u32 {
        let interval = self.min_interval_ms.load(Ordering::SeqCst).max(1);
        let rps = (1000_f64 / interval as f64).round() as u32;
        rps.max(1)
    }

    fn interval_ms(rps: u32) -> u64 {
        let safe_rps = rps.max(1);
        let interval_ms = (1000_f64 / safe_rps as f64).ceil() as u64;
        interval_ms.max(MIN_PROVIDER_INTERVAL_MS)
    }

    pub async fn wait(&self) {
        let interval = self.interval();
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
