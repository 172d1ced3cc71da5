//! Global outbound request budget shared by every credential loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ThrottleConfig;
use crate::error::ThrottleClosed;

const MIN_REFILL_PERIOD: Duration = Duration::from_micros(1);
const MAX_REFILL_PERIOD: Duration = Duration::from_secs(86_400);

/// Permission to send one request, bound to an egress route.
#[derive(Debug)]
#[must_use = "an unused slot should be handed back with `release_early`"]
pub struct Slot {
    route: usize,
}

impl Slot {
    /// Egress route this request should leave through.
    pub fn route(&self) -> usize {
        self.route
    }
}

/// Leaky bucket: one slot accrues every `1 / (rate * routes)` seconds, up to
/// `burst`. Waiters are served in FIFO order.
///
/// Must be created inside a tokio runtime; the refill task stops when the
/// throttle is dropped.
pub struct RequestThrottle {
    permits: Arc<Semaphore>,
    burst: usize,
    routes: usize,
    next_route: AtomicUsize,
    refill: JoinHandle<()>,
}

impl RequestThrottle {
    /// Starts the refill task. A rate that is not a positive number falls
    /// back to one request per second per route.
    pub fn new(config: &ThrottleConfig) -> Self {
        let routes = config.routes.max(1);
        let burst = config.burst.max(1);
        let per_route = if config.requests_per_second.is_finite() && config.requests_per_second > 0.0 {
            config.requests_per_second
        } else {
            tracing::warn!(rate = config.requests_per_second, "invalid throttle rate; using 1/s");
            1.0
        };
        let period = refill_period(per_route, routes);

        let permits = Arc::new(Semaphore::new(burst));
        let weak = Arc::downgrade(&permits);
        let refill = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(permits) = weak.upgrade() else {
                    break;
                };
                if permits.available_permits() < burst {
                    permits.add_permits(1);
                }
            }
        });

        Self {
            permits,
            burst,
            routes,
            next_route: AtomicUsize::new(0),
            refill,
        }
    }

    /// Waits until a slot is available.
    pub async fn acquire(&self) -> Result<Slot, ThrottleClosed> {
        self.permits.acquire().await.map_err(|_| ThrottleClosed)?.forget();
        let route = self.next_route.fetch_add(1, Ordering::Relaxed) % self.routes;
        Ok(Slot { route })
    }

    /// Hands an unused slot to the next waiter instead of wasting it.
    pub fn release_early(&self, slot: Slot) {
        let _ = slot;
        if self.permits.available_permits() < self.burst {
            self.permits.add_permits(1);
        }
    }

    /// Slots currently available without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Number of egress routes slots are spread over.
    pub fn routes(&self) -> usize {
        self.routes
    }
}

/// Time between two refills, kept within what `interval` accepts.
fn refill_period(per_route: f64, routes: usize) -> Duration {
    Duration::try_from_secs_f64(1.0 / (per_route * routes as f64))
        .unwrap_or(MAX_REFILL_PERIOD)
        .clamp(MIN_REFILL_PERIOD, MAX_REFILL_PERIOD)
}

impl Drop for RequestThrottle {
    fn drop(&mut self) {
        self.refill.abort();
        self.permits.close();
    }
}
