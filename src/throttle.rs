use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket bounding the request rate to one hub.
///
/// Holds up to `burst` tokens and refills at `qps` tokens per second. Callers
/// await [`Throttle::acquire`] before every API request.
#[derive(Debug)]
pub struct Throttle {
    burst: f64,
    qps: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl Throttle {
    pub fn new(burst: u32, qps: f32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            burst,
            qps: f64::from(qps).max(f64::MIN_POSITIVE),
            state: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        let mut bucket = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.refilled_at = now;

        if bucket.tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.qps);
            // The lock stays held so waiters are served in order.
            tokio::time::sleep(wait).await;
            bucket.tokens = 1.0;
            bucket.refilled_at = Instant::now();
        }
        bucket.tokens -= 1.0;
    }
}
