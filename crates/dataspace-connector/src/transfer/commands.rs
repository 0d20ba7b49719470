// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Out-of-band transfer process mutations.
//!
//! Each command is applied through a lease on the process, so it never races
//! the polling loop. A command that does not fit the current state is
//! acknowledged and ignored; it is only retried when the process is leased
//! elsewhere or the store fails.

use dataspace_core::provision::ProvisionedResource;
use dataspace_core::{Command, EntityState, StatefulEntity};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{TransferProcess, TransferProcessState};
use crate::workflow::{EntityCommand, decline};

macro_rules! transfer_command {
    ($name:ident) => {
        impl Command for $name {
            fn entity_id(&self) -> &str {
                &self.process_id
            }

            fn can_retry(&self) -> bool {
                true
            }
        }
    };
}

/// Cancel a transfer that has not ended yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTransferCommand {
    /// Target process.
    pub process_id: String,
    /// Why the transfer was cancelled.
    pub reason: Option<String>,
}

transfer_command!(CancelTransferCommand);

impl EntityCommand<TransferProcess> for CancelTransferCommand {
    fn apply(&self, process: &mut TransferProcess) -> bool {
        if process.state().is_none_or(|s| s.is_terminal()) {
            return decline("cancel", process);
        }
        match &self.reason {
            Some(reason) => process.fail_with(TransferProcessState::Cancelled, reason.clone()),
            None => process.transition_to(TransferProcessState::Cancelled),
        }
        info!(process_id = %process.id(), "Transfer cancelled");
        true
    }
}

/// Mark a running transfer as completed (counter-party completion message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTransferCommand {
    /// Target process.
    pub process_id: String,
}

transfer_command!(CompleteTransferCommand);

impl EntityCommand<TransferProcess> for CompleteTransferCommand {
    fn apply(&self, process: &mut TransferProcess) -> bool {
        match process.state() {
            Some(TransferProcessState::Requested | TransferProcessState::InProgress) => {
                process.transition_to(TransferProcessState::Completed);
                true
            }
            _ => decline("complete", process),
        }
    }
}

/// Move a transfer to ERROR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailTransferCommand {
    /// Target process.
    pub process_id: String,
    /// Failure cause.
    pub error_detail: String,
}

transfer_command!(FailTransferCommand);

impl EntityCommand<TransferProcess> for FailTransferCommand {
    fn apply(&self, process: &mut TransferProcess) -> bool {
        if process.state().is_none_or(|s| s.is_terminal()) {
            return decline("fail", process);
        }
        process.fail_with(TransferProcessState::Error, self.error_detail.clone());
        true
    }
}

/// Release the resources of a finished, cancelled or failed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprovisionTransferCommand {
    /// Target process.
    pub process_id: String,
}

transfer_command!(DeprovisionTransferCommand);

impl EntityCommand<TransferProcess> for DeprovisionTransferCommand {
    fn apply(&self, process: &mut TransferProcess) -> bool {
        let finished = matches!(
            process.state(),
            Some(
                TransferProcessState::Completed
                    | TransferProcessState::Cancelled
                    | TransferProcessState::Error
            )
        );
        if !finished || !process.has_provisioned_resources() {
            return decline("deprovision", process);
        }
        process.transition_to(TransferProcessState::Deprovisioning);
        true
    }
}

/// Result of an asynchronous provisioning that finished out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddProvisionedResourceCommand {
    /// Target process.
    pub process_id: String,
    /// Completed resource.
    pub resource: ProvisionedResource,
}

transfer_command!(AddProvisionedResourceCommand);

impl EntityCommand<TransferProcess> for AddProvisionedResourceCommand {
    fn apply(&self, process: &mut TransferProcess) -> bool {
        if process.state() != Some(TransferProcessState::Provisioning) {
            return decline("add-provisioned-resource", process);
        }
        process.add_provisioned(self.resource.clone());
        if process.is_provisioned() {
            process.set_pending(false);
            process.transition_to(TransferProcessState::Provisioned);
        }
        true
    }
}

/// Counter-party started the data flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransferCommand {
    /// Target process.
    pub process_id: String,
}

transfer_command!(StartTransferCommand);

impl EntityCommand<TransferProcess> for StartTransferCommand {
    fn apply(&self, process: &mut TransferProcess) -> bool {
        if process.state() != Some(TransferProcessState::Requested) {
            return decline("start", process);
        }
        process.transition_to(TransferProcessState::InProgress);
        true
    }
}
