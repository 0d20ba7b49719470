// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Out-of-band negotiation mutations.

use dataspace_core::{Command, EntityState, StatefulEntity};
use serde::{Deserialize, Serialize};

use super::{ContractAgreement, ContractNegotiation, ContractNegotiationState, NegotiationType};
use crate::workflow::{EntityCommand, decline};

/// End a negotiation; the counter-party is notified before it terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateNegotiationCommand {
    /// Target negotiation.
    pub negotiation_id: String,
    /// Termination reason sent to the counter-party.
    pub reason: String,
}

impl Command for TerminateNegotiationCommand {
    fn entity_id(&self) -> &str {
        &self.negotiation_id
    }

    fn can_retry(&self) -> bool {
        true
    }
}

impl EntityCommand<ContractNegotiation> for TerminateNegotiationCommand {
    fn apply(&self, negotiation: &mut ContractNegotiation) -> bool {
        match negotiation.state() {
            Some(state)
                if !state.is_terminal() && state != ContractNegotiationState::Terminating =>
            {
                negotiation.termination_reason = Some(self.reason.clone());
                negotiation.transition_to(ContractNegotiationState::Terminating);
                true
            }
            _ => decline("terminate", negotiation),
        }
    }
}

/// The provider sent its agreement to a consumer negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractAgreedCommand {
    /// Target negotiation.
    pub negotiation_id: String,
    /// Agreement received.
    pub agreement: ContractAgreement,
}

impl Command for ContractAgreedCommand {
    fn entity_id(&self) -> &str {
        &self.negotiation_id
    }

    fn can_retry(&self) -> bool {
        true
    }
}

impl EntityCommand<ContractNegotiation> for ContractAgreedCommand {
    fn apply(&self, negotiation: &mut ContractNegotiation) -> bool {
        if negotiation.negotiation_type != NegotiationType::Consumer
            || negotiation.state() != Some(ContractNegotiationState::Requested)
        {
            return decline("contract-agreed", negotiation);
        }
        negotiation.agreement = Some(self.agreement.clone());
        negotiation.transition_to(ContractNegotiationState::Agreed);
        true
    }
}
