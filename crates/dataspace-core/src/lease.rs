// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time-bounded exclusive claims on entities.
//!
//! A lease is valid until `leased_at + lease_duration`. Past that point it is
//! treated as absent, so entities held by a crashed runtime are reclaimed by
//! the next `next_not_leased` call (stale-lease reclaim).

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::entity::now_millis;

/// Default lease duration.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// An exclusive claim on one entity held by one runtime instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Runtime instance holding the lease.
    pub leased_by: String,
    /// When the lease was acquired or last renewed.
    pub leased_at: DateTime<Utc>,
    /// How long the lease stays valid after `leased_at`.
    pub lease_duration: Duration,
}

impl Lease {
    /// Acquire a lease starting now.
    pub fn new(leased_by: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            leased_by: leased_by.into(),
            leased_at: now_millis(),
            lease_duration,
        }
    }

    /// Instant after which the lease is stale.
    pub fn expires_at(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.lease_duration)
            .ok()
            .and_then(|delta| self.leased_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the lease is stale at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Whether the lease is stale now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether `owner` holds this lease.
    pub fn is_held_by(&self, owner: &str) -> bool {
        self.leased_by == owner
    }

    /// Whether `owner` holds this lease and it is still valid.
    pub fn is_valid_for(&self, owner: &str) -> bool {
        self.is_held_by(owner) && !self.is_expired()
    }

    /// Restart the lease period.
    pub fn renew(&mut self) {
        self.leased_at = now_millis();
    }
}

/// Identity and lease duration a store acquires leases with.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Identifier of this runtime instance.
    pub holder: String,
    /// Duration of every lease acquired.
    pub duration: Duration,
}

impl LeaseSettings {
    /// Settings for `holder` with the default duration.
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            duration: DEFAULT_LEASE_DURATION,
        }
    }

    /// Override the lease duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// New lease for this holder.
    pub fn acquire(&self) -> Lease {
        Lease::new(self.holder.clone(), self.duration)
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}
