// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract negotiations.
//!
//! ```text
//!   consumer:  INITIAL -> REQUESTING -> REQUESTED ..(agreement)..> AGREED -> FINALIZED
//!   provider:             REQUESTED -> AGREEING -> AGREED -> FINALIZED
//!
//!   any non-terminal --terminate--> TERMINATING -> TERMINATED
//! ```

mod commands;
mod manager;

pub use commands::{ContractAgreedCommand, TerminateNegotiationCommand};
pub use manager::ContractNegotiationManager;

use chrono::{DateTime, Utc};
use dataspace_core::{EntityMeta, EntityState, StatefulEntity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// States of a contract negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ContractNegotiationState {
    Initial,
    Requesting,
    Requested,
    Agreeing,
    Agreed,
    Finalized,
    Terminating,
    Terminated,
}

impl EntityState for ContractNegotiationState {
    fn code(self) -> i32 {
        match self {
            Self::Initial => 50,
            Self::Requesting => 100,
            Self::Requested => 200,
            Self::Agreeing => 825,
            Self::Agreed => 850,
            Self::Finalized => 1200,
            Self::Terminating => 1300,
            Self::Terminated => 1400,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            50 => Self::Initial,
            100 => Self::Requesting,
            200 => Self::Requested,
            825 => Self::Agreeing,
            850 => Self::Agreed,
            1200 => Self::Finalized,
            1300 => Self::Terminating,
            1400 => Self::Terminated,
            _ => return None,
        })
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Terminated)
    }
}

/// Side of the negotiation this connector plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationType {
    /// Asks for a contract.
    Consumer,
    /// Grants contracts.
    Provider,
}

impl NegotiationType {
    /// Value stored in the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consumer => "CONSUMER",
            Self::Provider => "PROVIDER",
        }
    }
}

/// Offer the negotiation is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractOffer {
    /// Offer id.
    pub id: String,
    /// Offered asset.
    pub asset_id: String,
    /// Usage policy.
    #[serde(default)]
    pub policy: Value,
}

/// Agreement concluded by a negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractAgreement {
    /// Agreement id.
    pub id: String,
    /// Agreed asset.
    pub asset_id: String,
    /// When the provider signed.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub signing_date: DateTime<Utc>,
    /// Agreed policy.
    #[serde(default)]
    pub policy: Value,
}

/// A contract negotiation driven by the [`ContractNegotiationManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractNegotiation {
    /// Engine metadata.
    #[serde(flatten)]
    pub meta: EntityMeta,
    /// Consumer or provider side.
    #[serde(rename = "type")]
    pub negotiation_type: NegotiationType,
    /// Participant id of the counter-party.
    pub counter_party_id: String,
    /// Counter-party endpoint.
    pub counter_party_address: String,
    /// Protocol identifier.
    pub protocol: String,
    /// Negotiated offer.
    pub offer: ContractOffer,
    /// Agreement, once reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<ContractAgreement>,
    /// Why the negotiation is being terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
}

impl ContractNegotiation {
    /// Consumer negotiation in `INITIAL`.
    pub fn consumer(
        id: impl Into<String>,
        counter_party_id: impl Into<String>,
        counter_party_address: impl Into<String>,
        protocol: impl Into<String>,
        offer: ContractOffer,
    ) -> Self {
        Self::with_state(
            id,
            NegotiationType::Consumer,
            ContractNegotiationState::Initial,
            counter_party_id,
            counter_party_address,
            protocol,
            offer,
        )
    }

    /// Provider negotiation for a received request, in `REQUESTED`.
    pub fn provider(
        id: impl Into<String>,
        counter_party_id: impl Into<String>,
        counter_party_address: impl Into<String>,
        protocol: impl Into<String>,
        offer: ContractOffer,
    ) -> Self {
        Self::with_state(
            id,
            NegotiationType::Provider,
            ContractNegotiationState::Requested,
            counter_party_id,
            counter_party_address,
            protocol,
            offer,
        )
    }

    fn with_state(
        id: impl Into<String>,
        negotiation_type: NegotiationType,
        state: ContractNegotiationState,
        counter_party_id: impl Into<String>,
        counter_party_address: impl Into<String>,
        protocol: impl Into<String>,
        offer: ContractOffer,
    ) -> Self {
        Self {
            meta: EntityMeta::new(id, state.code()),
            negotiation_type,
            counter_party_id: counter_party_id.into(),
            counter_party_address: counter_party_address.into(),
            protocol: protocol.into(),
            offer,
            agreement: None,
            termination_reason: None,
        }
    }
}

impl StatefulEntity for ContractNegotiation {
    type State = ContractNegotiationState;
    const ENTITY_TYPE: &'static str = "contract_negotiation";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn offer() -> ContractOffer {
        ContractOffer {
            id: "offer-1".to_string(),
            asset_id: "asset-1".to_string(),
            policy: serde_json::json!({"permission": [{"action": "use"}]}),
        }
    }
}
