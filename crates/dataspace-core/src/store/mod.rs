// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leasing store contract and backends.
//!
//! The store is the only resource shared between connector runtimes. All
//! cross-runtime coordination is expressed through leases:
//!
//! - [`StateEntityStore::next_not_leased`] selects and leases in one atomic
//!   step, so no entity is handed to two callers while its lease is valid.
//! - [`StateEntityStore::save`] is an optimistic check: an existing entity is
//!   only written while the caller holds a valid lease on it, otherwise it
//!   fails with
//!   [`EngineError::LeaseConflict`](crate::error::EngineError::LeaseConflict).
//!   A successful save releases the caller's lease.
//! - [`StateEntityStore::create`] inserts a new entity and fails with
//!   [`EngineError::AlreadyExists`](crate::error::EngineError::AlreadyExists)
//!   when the id is taken.
//! - [`StateEntityStore::break_lease`] releases a lease after a failed attempt
//!   so the entity can be retried on the next tick instead of after expiry.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use self::memory::InMemoryStateEntityStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteStateEntityStore;

use async_trait::async_trait;

use crate::entity::StatefulEntity;
use crate::error::Result;
use crate::lease::Lease;
use crate::query::{Criterion, QuerySpec};

/// Persistence contract every workflow store implements.
#[async_trait]
pub trait StateEntityStore<E: StatefulEntity>: Send + Sync {
    /// Identity this store acquires leases with.
    fn lease_holder(&self) -> &str;

    /// Atomically select up to `limit` unleased entities matching `filter`,
    /// oldest `state_timestamp` first, lease them to this holder and return
    /// snapshot copies.
    async fn next_not_leased(&self, limit: usize, filter: &[Criterion]) -> Result<Vec<E>>;

    /// Find an entity without leasing it.
    async fn find_by_id(&self, id: &str) -> Result<Option<E>>;

    /// Lease a single entity and return it.
    ///
    /// Fails with `NotFound` for unknown ids and `AlreadyLeased` when another
    /// holder has a valid lease.
    async fn find_by_id_and_lease(&self, id: &str) -> Result<E>;

    /// Insert a new, unleased entity. Fails with `AlreadyExists` when the id
    /// is taken; the check and the insert are one atomic step.
    async fn create(&self, entity: &E) -> Result<()>;

    /// Update an entity leased by this holder and release the lease.
    ///
    /// Unknown ids are inserted. An existing entity without a valid lease of
    /// this holder fails with `LeaseConflict`, since another runtime may have
    /// progressed it in the meantime.
    async fn save(&self, entity: &E) -> Result<()>;

    /// Extend this holder's valid lease on the entity.
    async fn renew_lease(&self, entity: &E) -> Result<()>;

    /// Release this holder's lease (no-op when the entity is unleased).
    async fn break_lease(&self, entity: &E) -> Result<()>;

    /// Delete an entity that no other holder leases.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Filtered, sorted, paginated read.
    async fn query(&self, spec: &QuerySpec) -> Result<Vec<E>>;

    /// Current valid lease on the entity, if any.
    async fn lease(&self, id: &str) -> Result<Option<Lease>>;
}
