// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer processes.
//!
//! ```text
//!   INITIAL -> PROVISIONING -> PROVISIONED -+-> REQUESTING -> REQUESTED -+
//!                                           |        (consumer)          |
//!                                           +----------------------------+-> IN_PROGRESS
//!                                                    (provider)
//!   IN_PROGRESS -> COMPLETED -> DEPROVISIONING -> DEPROVISIONED -> ENDED
//!
//!   any non-terminal --cancel--> CANCELLED       --fail / retries--> ERROR
//! ```

mod commands;
mod manager;

pub use commands::{
    AddProvisionedResourceCommand, CancelTransferCommand, CompleteTransferCommand,
    DeprovisionTransferCommand, FailTransferCommand, StartTransferCommand,
};
pub use manager::{TransferCollaborators, TransferProcessManager};

use dataspace_core::provision::{DeprovisionedResource, ProvisionedResource, ResourceDefinition};
use dataspace_core::{EntityMeta, EntityState, StatefulEntity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// States of a transfer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum TransferProcessState {
    Initial,
    Provisioning,
    Provisioned,
    Requesting,
    Requested,
    InProgress,
    Completed,
    Deprovisioning,
    Deprovisioned,
    Ended,
    Cancelled,
    Error,
}

impl EntityState for TransferProcessState {
    fn code(self) -> i32 {
        match self {
            Self::Initial => 100,
            Self::Provisioning => 200,
            Self::Provisioned => 300,
            Self::Requesting => 400,
            Self::Requested => 500,
            Self::InProgress => 600,
            Self::Completed => 800,
            Self::Deprovisioning => 900,
            Self::Deprovisioned => 1000,
            Self::Ended => 1100,
            Self::Cancelled => 1200,
            Self::Error => -1,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            100 => Self::Initial,
            200 => Self::Provisioning,
            300 => Self::Provisioned,
            400 => Self::Requesting,
            500 => Self::Requested,
            600 => Self::InProgress,
            800 => Self::Completed,
            900 => Self::Deprovisioning,
            1000 => Self::Deprovisioned,
            1100 => Self::Ended,
            1200 => Self::Cancelled,
            -1 => Self::Error,
            _ => return None,
        })
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Cancelled | Self::Error)
    }
}

/// Side of the transfer this connector plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferProcessType {
    /// Receives data.
    Consumer,
    /// Serves data.
    Provider,
}

impl TransferProcessType {
    /// Value stored in the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consumer => "CONSUMER",
            Self::Provider => "PROVIDER",
        }
    }
}

/// Input for a new transfer process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Counter-party endpoint.
    pub counter_party_address: String,
    /// Protocol identifier.
    pub protocol: String,
    /// Agreement the transfer runs under.
    pub contract_id: String,
    /// Transferred asset.
    pub asset_id: String,
    /// Transfer type (e.g. `HttpData-PULL`).
    pub transfer_type: String,
    /// Where the data goes.
    #[serde(default)]
    pub data_destination: Value,
    /// Resources to provision before the transfer starts.
    #[serde(default)]
    pub resources: Vec<ResourceDefinition>,
}

/// A data transfer driven by the [`TransferProcessManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProcess {
    /// Engine metadata.
    #[serde(flatten)]
    pub meta: EntityMeta,
    /// Consumer or provider side.
    #[serde(rename = "type")]
    pub process_type: TransferProcessType,
    /// Counter-party endpoint.
    pub counter_party_address: String,
    /// Protocol identifier.
    pub protocol: String,
    /// Agreement the transfer runs under.
    pub contract_id: String,
    /// Transferred asset.
    pub asset_id: String,
    /// Transfer type.
    pub transfer_type: String,
    /// Where the data goes.
    #[serde(default)]
    pub data_destination: Value,
    /// Resources to provision.
    #[serde(default)]
    pub resource_definitions: Vec<ResourceDefinition>,
    /// Provisioning results, including in-process ones.
    #[serde(default)]
    pub provisioned_resources: Vec<ProvisionedResource>,
    /// Deprovisioning results.
    #[serde(default)]
    pub deprovisioned_resources: Vec<DeprovisionedResource>,
}

impl TransferProcess {
    /// New process in `INITIAL`.
    pub fn new(
        id: impl Into<String>,
        process_type: TransferProcessType,
        request: TransferRequest,
    ) -> Self {
        let id = id.into();
        let resource_definitions = request
            .resources
            .into_iter()
            .map(|mut definition| {
                definition.flow_id = id.clone();
                definition
            })
            .collect();
        Self {
            meta: EntityMeta::new(id, TransferProcessState::Initial.code()),
            process_type,
            counter_party_address: request.counter_party_address,
            protocol: request.protocol,
            contract_id: request.contract_id,
            asset_id: request.asset_id,
            transfer_type: request.transfer_type,
            data_destination: request.data_destination,
            resource_definitions,
            provisioned_resources: Vec::new(),
            deprovisioned_resources: Vec::new(),
        }
    }

    /// Definitions with no provisioning result yet.
    pub fn unprovisioned_definitions(&self) -> Vec<ResourceDefinition> {
        self.resource_definitions
            .iter()
            .filter(|d| !self.provisioned_resources.iter().any(|p| p.resource_id == d.id))
            .cloned()
            .collect()
    }

    /// Record a provisioning result, replacing an earlier one for the same resource.
    pub fn add_provisioned(&mut self, resource: ProvisionedResource) {
        self.provisioned_resources
            .retain(|p| p.resource_id != resource.resource_id);
        self.provisioned_resources.push(resource);
    }

    /// Whether every definition is provisioned and none is still in process.
    pub fn is_provisioned(&self) -> bool {
        self.resource_definitions.iter().all(|d| {
            self.provisioned_resources
                .iter()
                .any(|p| p.resource_id == d.id && !p.in_process)
        })
    }

    /// Whether any resource was provisioned.
    pub fn has_provisioned_resources(&self) -> bool {
        !self.provisioned_resources.is_empty()
    }

    /// Provisioned definitions not yet deprovisioned.
    pub fn resources_to_deprovision(&self) -> Vec<ResourceDefinition> {
        self.resource_definitions
            .iter()
            .filter(|d| {
                self.provisioned_resources.iter().any(|p| p.resource_id == d.id)
                    && !self
                        .deprovisioned_resources
                        .iter()
                        .any(|r| r.resource_id == d.id && !r.in_process)
            })
            .cloned()
            .collect()
    }

    /// Record a deprovisioning result.
    pub fn add_deprovisioned(&mut self, resource: DeprovisionedResource) {
        self.deprovisioned_resources
            .retain(|r| r.resource_id != resource.resource_id);
        self.deprovisioned_resources.push(resource);
    }
}

impl StatefulEntity for TransferProcess {
    type State = TransferProcessState;
    const ENTITY_TYPE: &'static str = "transfer_process";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
