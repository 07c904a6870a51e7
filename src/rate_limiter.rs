//! Token-bucket rate limiter shared by every RPC worker (§4.1).
//!
//! Structurally this plays the same role as a peer-keyed token bucket (see
//! the network layer's per-peer limiter), generalised to a single
//! process-wide bucket and rebuilt on lock-free compare-and-swap instead of
//! a mutex, per the invariant that a failed CAS retries rather than blocks.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;

const MICRO: i64 = 1_000_000;
const BACKOFF: Duration = Duration::from_millis(100);

/// Lock-free token bucket. `acquire` blocks (by polling on a short backoff)
/// until a token is available; `try_acquire` never blocks.
pub struct RateLimiter {
    epoch: Instant,
    tokens_micro: AtomicI64,
    capacity_micro: AtomicI64,
    refill_per_sec_micro: AtomicI64,
    last_refill_nanos: AtomicU64,
    requests_per_minute: AtomicU32,
}

fn capacity_for(requests_per_minute: u32) -> i64 {
    std::cmp::max(1, requests_per_minute as i64 / 60)
}

impl RateLimiter {
    /// Create a limiter enforcing `requests_per_minute` overall.
    pub fn new(requests_per_minute: u32) -> Self {
        let capacity = capacity_for(requests_per_minute);
        Self {
            epoch: Instant::now(),
            tokens_micro: AtomicI64::new(capacity * MICRO),
            capacity_micro: AtomicI64::new(capacity * MICRO),
            refill_per_sec_micro: AtomicI64::new(capacity * MICRO),
            last_refill_nanos: AtomicU64::new(0),
            requests_per_minute: AtomicU32::new(requests_per_minute),
        }
    }

    /// Replace the bucket's capacity at runtime. Existing token balance is
    /// clamped to the new capacity, never topped up beyond it.
    pub fn reconfigure(&self, requests_per_minute: u32) {
        let capacity = capacity_for(requests_per_minute);
        self.requests_per_minute
            .store(requests_per_minute, Ordering::Relaxed);
        self.capacity_micro
            .store(capacity * MICRO, Ordering::Relaxed);
        self.refill_per_sec_micro
            .store(capacity * MICRO, Ordering::Relaxed);
        self.tokens_micro
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(std::cmp::min(t, capacity * MICRO))
            })
            .ok();
    }

    fn refill(&self) {
        loop {
            let last = self.last_refill_nanos.load(Ordering::Acquire);
            let now = self.epoch.elapsed().as_nanos() as u64;
            if now <= last {
                return;
            }
            if self
                .last_refill_nanos
                .compare_exchange_weak(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let elapsed_nanos = now - last;
            let rate = self.refill_per_sec_micro.load(Ordering::Relaxed) as i128;
            let added = (elapsed_nanos as i128 * rate / 1_000_000_000) as i64;
            if added > 0 {
                let capacity = self.capacity_micro.load(Ordering::Relaxed);
                self.tokens_micro
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                        Some(std::cmp::min(capacity, t + added))
                    })
                    .ok();
            }
            return;
        }
    }

    /// Non-blocking: consume one token iff available, return whether it did.
    pub fn try_acquire(&self) -> bool {
        self.refill();
        loop {
            let tokens = self.tokens_micro.load(Ordering::Acquire);
            if tokens < MICRO {
                return false;
            }
            match self.tokens_micro.compare_exchange_weak(
                tokens,
                tokens - MICRO,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// Blocks until a token is consumed. Cancellation-safe: dropping the
    /// returned future (e.g. via `tokio::select!` or task abort) simply
    /// abandons the wait without side effects.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            sleep(BACKOFF).await;
        }
    }

    /// Current token count, after a lazy refill, rounded down to whole tokens.
    pub fn available(&self) -> u32 {
        self.refill();
        (self.tokens_micro.load(Ordering::Acquire) / MICRO).max(0) as u32
    }

    /// The configured requests-per-minute target.
    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn capacity_floor_is_one() {
        assert_eq!(capacity_for(0), 1);
        assert_eq!(capacity_for(30), 1);
        assert_eq!(capacity_for(120), 2);
    }

    #[test]
    fn try_acquire_exhausts_burst_then_refuses() {
        let limiter = RateLimiter::new(60); // capacity 1
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn acquire_unblocks_after_refill() {
        let limiter = RateLimiter::new(600); // capacity 10, refills 10/sec
        for _ in 0..10 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn concurrent_acquire_never_exceeds_capacity_per_tick() {
        let limiter = Arc::new(RateLimiter::new(60));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.try_acquire() }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[test]
    fn reconfigure_clamps_existing_balance() {
        let limiter = RateLimiter::new(6000); // capacity 100
        limiter.reconfigure(60); // capacity 1
        assert_eq!(limiter.available(), 1);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The floor of one token per bucket holds for any configured rate.
            #[test]
            fn capacity_never_falls_below_one(requests_per_minute in any::<u32>()) {
                prop_assert!(capacity_for(requests_per_minute) >= 1);
            }

            /// A freshly built bucket never reports more tokens than its capacity,
            /// and draining it with try_acquire never makes available() underflow.
            #[test]
            fn available_stays_within_capacity_under_arbitrary_draining(
                requests_per_minute in 1u32..10_000,
                draws in 0usize..200,
            ) {
                let limiter = RateLimiter::new(requests_per_minute);
                let capacity = capacity_for(requests_per_minute) as u32;
                prop_assert!(limiter.available() <= capacity);
                for _ in 0..draws {
                    limiter.try_acquire();
                    prop_assert!(limiter.available() <= capacity);
                }
            }

            /// Reconfiguring never leaves the balance above the new capacity.
            #[test]
            fn reconfigure_never_leaves_balance_above_new_capacity(
                initial_rate in 1u32..10_000,
                new_rate in 1u32..10_000,
            ) {
                let limiter = RateLimiter::new(initial_rate);
                limiter.reconfigure(new_rate);
                let new_capacity = capacity_for(new_rate) as u32;
                prop_assert!(limiter.available() <= new_capacity);
            }
        }
    }
}
