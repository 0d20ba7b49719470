// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inter-tick delay policies.
//!
//! After every tick the state machine asks its [`WaitStrategy`] how long to
//! sleep: [`WaitStrategy::success`] when at least one entity was processed,
//! [`WaitStrategy::retry_in_millis`] otherwise.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Computes the delay before the next tick.
pub trait WaitStrategy: Send + Sync {
    /// Base delay, also used for the initial and graceful-shutdown wait.
    fn wait_for_millis(&self) -> u64;

    /// Delay after a tick that processed work.
    fn success(&self) -> u64;

    /// Delay after a tick that processed nothing or failed.
    fn retry_in_millis(&self) -> u64;
}

/// Sleeps the same amount after every tick.
#[derive(Debug, Clone)]
pub struct FixedWaitStrategy {
    millis: u64,
}

impl FixedWaitStrategy {
    /// Strategy waiting `millis` between ticks.
    pub fn new(millis: u64) -> Self {
        Self { millis }
    }

    /// Strategy waiting `duration` between ticks.
    pub fn from_duration(duration: Duration) -> Self {
        Self::new(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

impl Default for FixedWaitStrategy {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl WaitStrategy for FixedWaitStrategy {
    fn wait_for_millis(&self) -> u64 {
        self.millis
    }

    fn success(&self) -> u64 {
        self.millis
    }

    fn retry_in_millis(&self) -> u64 {
        self.millis
    }
}

/// Doubles the delay on every consecutive idle tick, up to a cap.
///
/// A productive tick resets the back-off and returns the base delay.
#[derive(Debug)]
pub struct ExponentialWaitStrategy {
    base_millis: u64,
    max_millis: u64,
    idle_ticks: AtomicU32,
}

impl ExponentialWaitStrategy {
    /// Strategy starting at `base_millis`, never exceeding `max_millis`.
    pub fn new(base_millis: u64, max_millis: u64) -> Self {
        Self {
            base_millis,
            max_millis: max_millis.max(base_millis),
            idle_ticks: AtomicU32::new(0),
        }
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn wait_for_millis(&self) -> u64 {
        self.base_millis
    }

    fn success(&self) -> u64 {
        self.idle_ticks.store(0, Ordering::Relaxed);
        self.base_millis
    }

    fn retry_in_millis(&self) -> u64 {
        let exponent = self.idle_ticks.fetch_add(1, Ordering::Relaxed).min(32);
        self.base_millis
            .saturating_mul(1u64 << exponent)
            .min(self.max_millis)
    }
}
