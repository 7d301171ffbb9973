//! Resilience utilities: batch retry backoff, write throttling, destination
//! leases.
//!
//! - [`RetryConfig`]: Exponential backoff for transient batch failures
//! - [`RateLimiter`]: Token bucket on batch writes to one destination
//! - [`Bulkhead`]: Semaphore limiting concurrent operations
//! - [`DestinationLeases`]: One exclusive lease per non-concurrent-safe
//!   destination, shared by every job that writes there
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), collection_sync::resilience::BulkheadFull> {
//! use collection_sync::resilience::{RateLimiter, Bulkhead, RateLimitConfig};
//!
//! // Throttle: 50 batches/sec with burst of 10
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! let bulkhead = Bulkhead::new(1);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Retry policy for one batch write.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    /// Three retries after the first attempt, 500ms doubling to 30s.
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::testing()
        }
    }

    /// Calculate delay for a given retry number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1).min(i32::MAX as usize) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket configuration: tokens refill at `refill_rate` per second, up
/// to `burst_size`. Each batch write consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 50 batches/sec with burst of 10.
    fn default() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 50,
        }
    }
}

impl RateLimitConfig {
    /// Gentle on fragile destinations.
    pub fn conservative() -> Self {
        Self {
            burst_size: 1,
            refill_rate: 5,
        }
    }
}

/// Token bucket rate limiter around a destination's batch writes.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for a token. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Returns `false` if the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Limits how many operations run at once; waiters queue on the semaphore.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary. The slot is released when the
    /// permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore.clone().acquire_owned().await.map_err(|_| BulkheadFull {
            max_concurrent: self.max_concurrent,
        })
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

// =============================================================================
// Destination leases
// =============================================================================

/// Held for the duration of a job's writes. `Shared` leases are free.
#[derive(Debug)]
pub enum DestinationLease {
    Exclusive(OwnedSemaphorePermit),
    Shared,
}

impl DestinationLease {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Exclusive(_))
    }
}

/// Serializes writers to destinations that cannot take concurrent batches.
///
/// Every job writing to a destination whose adapter is not `concurrent_safe`
/// takes the same single-permit [`Bulkhead`], keyed by destination name.
#[derive(Debug, Default)]
pub struct DestinationLeases {
    bulkheads: Mutex<HashMap<String, Arc<Bulkhead>>>,
}

impl DestinationLeases {
    pub fn new() -> Self {
        Self::default()
    }

    fn bulkhead_for(&self, destination: &str) -> Arc<Bulkhead> {
        let mut map = self.bulkheads.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(destination.to_string())
                .or_insert_with(|| Arc::new(Bulkhead::new(1))),
        )
    }

    pub async fn acquire(&self, destination: &str, concurrent_safe: bool) -> Result<DestinationLease, BulkheadFull> {
        if concurrent_safe {
            return Ok(DestinationLease::Shared);
        }
        let bulkhead = self.bulkhead_for(destination);
        if bulkhead.is_full() {
            debug!(destination, "Waiting for exclusive destination lease");
        }
        bulkhead.acquire().await.map(DestinationLease::Exclusive)
    }

    /// `true` while some job holds the destination's exclusive lease.
    pub fn is_held(&self, destination: &str) -> bool {
        let map = self.bulkheads.lock().unwrap_or_else(|e| e.into_inner());
        map.get(destination).is_some_and(|b| b.is_full())
    }
}
