//! Client-side throttling: per-service token buckets and a circuit breaker.

use std::time::Duration;

use azclone_config::ServiceRateLimits;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// The cloud services the client throttles independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    ResourceGraph,
    Arm,
    Storage,
}

struct Bucket {
    /// Tokens per second.
    rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: u32) -> Self {
        let rate = f64::from(rate.max(1));
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.rate);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// One token bucket per cloud service, sized from the configured req/s caps.
pub struct RateLimiter {
    resource_graph: Bucket,
    arm: Bucket,
    storage: Bucket,
}

impl RateLimiter {
    pub fn new(limits: &ServiceRateLimits) -> Self {
        Self {
            resource_graph: Bucket::new(limits.resource_graph),
            arm: Bucket::new(limits.arm),
            storage: Bucket::new(limits.storage),
        }
    }

    pub async fn acquire(&self, service: Service) {
        match service {
            Service::ResourceGraph => self.resource_graph.acquire().await,
            Service::Arm => self.arm.acquire().await,
            Service::Storage => self.storage.acquire().await,
        }
    }
}

const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Opens after five consecutive transient failures, re-closes after 30 s.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
}

struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// True when requests may proceed. While open, everything is rejected
    /// until the cooldown elapses; the first call after the cooldown
    /// half-closes the breaker and is allowed through as a probe.
    pub async fn check(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.opened_at {
            Some(opened) if opened.elapsed() < BREAKER_COOLDOWN => false,
            Some(_) => {
                state.opened_at = None;
                state.consecutive_failures = BREAKER_THRESHOLD - 1;
                true
            }
            None => true,
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= BREAKER_THRESHOLD && state.opened_at.is_none() {
            warn!(
                failures = state.consecutive_failures,
                "Circuit breaker opened"
            );
            state.opened_at = Some(Instant::now());
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
