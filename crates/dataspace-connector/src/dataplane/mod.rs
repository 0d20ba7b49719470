// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data-plane instances: registration, health tracking and selection.
//!
//! ```text
//!   REGISTERED --probe--> AVAILABLE <--recheck--> UNAVAILABLE
//! ```
//!
//! The [`DataPlaneInstanceManager`] probes freshly registered instances and
//! re-probes known ones once their last state change is older than the
//! recheck interval. The [`DataPlaneSelectorManager`] picks one AVAILABLE
//! instance able to serve a transfer.

mod health;
mod instance_manager;
mod selector;

pub use health::{DataPlaneHealthCheck, TcpHealthCheck};
pub use instance_manager::DataPlaneInstanceManager;
pub use selector::{
    DataPlaneSelectorManager, FIRST, FirstStrategy, RANDOM, RandomStrategy, SelectionStrategy,
    SelectionStrategyRegistry,
};

use dataspace_core::{EntityMeta, EntityState, StatefulEntity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// States of a data-plane instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataPlaneInstanceState {
    /// Known but never probed.
    Registered,
    /// Last probe succeeded.
    Available,
    /// Last probe failed.
    Unavailable,
}

impl EntityState for DataPlaneInstanceState {
    fn code(self) -> i32 {
        match self {
            Self::Registered => 100,
            Self::Available => 200,
            Self::Unavailable => 300,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            100 => Some(Self::Registered),
            200 => Some(Self::Available),
            300 => Some(Self::Unavailable),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        false
    }
}

/// A data plane the connector can delegate transfers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneInstance {
    /// Engine metadata.
    #[serde(flatten)]
    pub meta: EntityMeta,
    /// Control endpoint of the data plane.
    pub url: String,
    /// Source types it can read from.
    #[serde(default)]
    pub allowed_source_types: Vec<String>,
    /// Transfer types it supports.
    #[serde(default)]
    pub allowed_transfer_types: Vec<String>,
    /// Free-form attributes.
    #[serde(default)]
    pub properties: Value,
}

impl DataPlaneInstance {
    /// Newly registered instance.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            meta: EntityMeta::new(id, DataPlaneInstanceState::Registered.code()),
            url: url.into(),
            allowed_source_types: Vec::new(),
            allowed_transfer_types: Vec::new(),
            properties: Value::Null,
        }
    }

    /// Add a supported source type.
    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.allowed_source_types.push(source_type.into());
        self
    }

    /// Add a supported transfer type.
    pub fn with_transfer_type(mut self, transfer_type: impl Into<String>) -> Self {
        self.allowed_transfer_types.push(transfer_type.into());
        self
    }

    /// Whether the instance serves `source_type` with `transfer_type`.
    pub fn can_handle(&self, source_type: &str, transfer_type: &str) -> bool {
        self.allowed_source_types.iter().any(|t| t == source_type)
            && self.allowed_transfer_types.iter().any(|t| t == transfer_type)
    }
}

impl StatefulEntity for DataPlaneInstance {
    type State = DataPlaneInstanceState;
    const ENTITY_TYPE: &'static str = "data_plane_instance";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
