// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dataspace Connector - Workflow Managers
//!
//! Concrete managers built on the `dataspace-core` engine. Each manager owns
//! one [`dataspace_core::StateMachineManager`], registers a processor per
//! active state of its workflow and accepts out-of-band commands through a
//! bounded queue drained on every tick.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       ConnectorRuntime                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐ │
//! │  │  Contract    │  │  Transfer    │  │  Data-plane instance   │ │
//! │  │ negotiation  │  │  process     │  │  manager + selector    │ │
//! │  └──────────────┘  └──────────────┘  └────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!          │ dispatch            │ provision / status     │ probe
//!          ▼                     ▼                        ▼
//!   RemoteMessageDispatcher   ProvisionManager     DataPlaneHealthCheck
//!                             StatusChecker
//! ```
//!
//! # Managers
//!
//! | Manager | Entity | Commands |
//! |---------|--------|----------|
//! | [`transfer::TransferProcessManager`] | [`transfer::TransferProcess`] | cancel, complete, fail, start, deprovision, add provisioned resource |
//! | [`negotiation::ContractNegotiationManager`] | [`negotiation::ContractNegotiation`] | terminate, contract agreed |
//! | [`dataplane::DataPlaneInstanceManager`] | [`dataplane::DataPlaneInstance`] | none |
//! | [`dataplane::DataPlaneSelectorManager`] | read-only | none |
//!
//! Protocol bindings, provisioners and health probes are traits so the
//! managers can be driven by real peers or by test doubles such as
//! [`dispatcher::RecordingDispatcher`].

#![deny(missing_docs)]

/// Environment-based configuration.
pub mod config;

/// Data-plane instances, health probes and selection.
pub mod dataplane;

/// Counter-party message boundary.
pub mod dispatcher;

/// Connector error type.
pub mod error;

/// Contract negotiation workflow.
pub mod negotiation;

/// Store and manager wiring.
pub mod runtime;

/// Transfer process workflow.
pub mod transfer;

mod workflow;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::{ConnectorCollaborators, ConnectorRuntime};
