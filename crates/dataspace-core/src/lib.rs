// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dataspace Core - Stateful Entity Orchestration Engine
//!
//! This crate drives long-lived workflow entities (contract negotiations,
//! transfer processes, data-plane instances) through their state graphs. It
//! is safe to run many connector instances against one shared store: all
//! coordination between them happens through time-bounded leases.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Concrete managers                            │
//! │        (transfer, negotiation, data-plane instance/selector)     │
//! └──────────────────────────────────────────────────────────────────┘
//!        │ registers processors                 │ enqueue(command)
//!        ▼                                      ▼
//! ┌───────────────────────────┐      ┌─────────────────────────────┐
//! │   StateMachineManager     │      │        CommandQueue         │
//! │ tick: run processors,     │◄─────│ drained by CommandProcessor │
//! │ sleep per WaitStrategy    │      │ → CommandHandlerRegistry    │
//! └───────────────────────────┘      └─────────────────────────────┘
//!        │ next_not_leased / save / break_lease
//!        ▼
//! ┌───────────────────────────┐      ┌─────────────────────────────┐
//! │     StateEntityStore      │      │      ProvisionManager       │
//! │  in-memory  |  SQLite     │      │ concurrent per-resource     │
//! │  (leases, JSON payload)   │      │ provision / deprovision     │
//! └───────────────────────────┘      └─────────────────────────────┘
//! ```
//!
//! # Tick
//!
//! 1. Every [`processor::Processor`] runs once, in registration order.
//! 2. A [`processor::StateProcessor`] leases up to `batch_size` entities in
//!    its state, oldest `state_timestamp` first, and runs the transition on
//!    each inside a tracing span carrying the entity's `traceparent`.
//! 3. Failed or panicking transitions bump `state_count`, record the error
//!    and release the lease so the entity is retried on a later tick.
//! 4. The manager sleeps for [`wait::WaitStrategy::success`] if anything was
//!    processed, [`wait::WaitStrategy::retry_in_millis`] otherwise.
//!
//! # Errors
//!
//! A failed command is re-enqueued only when the command allows retries and
//! [`EngineError::is_retryable`] holds for the error.
//!
//! | Code | Meaning | Retryable |
//! |------|---------|-----------|
//! | `NOT_FOUND` | entity does not exist | no |
//! | `ALREADY_EXISTS` | entity id is taken | no |
//! | `LEASE_CONFLICT` | another runtime progressed the entity | no |
//! | `ALREADY_LEASED` | entity is being processed elsewhere | yes |
//! | `TRANSITION_FAILED` | workflow step failed | yes |
//! | `HANDLER_NOT_FOUND` | no handler for a command type | no |
//! | `QUEUE_FULL` | command queue at capacity | no (backpressure) |
//!
//! # Features
//!
//! - `sqlite` (default): [`store::SqliteStateEntityStore`] and [`migrations`].

#![deny(missing_docs)]

/// Out-of-band commands: bounded queue, handler registry, drain processor.
pub mod command;

/// Stateful entity model and typed workflow states.
pub mod entity;

/// Error types with stable error codes.
pub mod error;

/// Leases and lease settings.
pub mod lease;

/// Embedded SQLite migrations.
#[cfg(feature = "sqlite")]
pub mod migrations;

/// Processors run on every tick.
pub mod processor;

/// Concurrent provisioning and deprovisioning of sub-resources.
pub mod provision;

/// Filter criteria and query specifications.
pub mod query;

/// The polling scheduler.
pub mod state_machine;

/// Leasing store contract and implementations.
pub mod store;

/// Inter-tick delay policies.
pub mod wait;

pub use command::{Command, CommandHandler, CommandHandlerRegistry, CommandProcessor, CommandQueue};
pub use entity::{EntityMeta, EntityState, StatefulEntity};
pub use error::{EngineError, Result};
pub use lease::{Lease, LeaseSettings};
pub use processor::{Processor, StateProcessor};
pub use query::{Criterion, Operator, QuerySpec};
pub use state_machine::{ManagerStatus, StateMachineConfig, StateMachineManager};
pub use store::StateEntityStore;
