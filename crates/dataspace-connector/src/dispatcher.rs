// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Boundary to the counter-party connector.
//!
//! The dataspace protocol bindings live outside this crate. Managers hand a
//! [`RemoteMessage`] to a [`RemoteMessageDispatcher`] and treat any error as
//! a failed attempt of the current state.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Protocol message kinds sent by the managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Consumer asks the provider to start a transfer.
    TransferRequest,
    /// Provider reports the data flow has started.
    TransferStart,
    /// Either side reports a finished transfer.
    TransferCompletion,
    /// Consumer asks the provider for a contract.
    ContractRequest,
    /// Provider sends the signed agreement.
    ContractAgreement,
    /// Consumer confirms the agreement.
    ContractVerification,
    /// Provider finalizes the negotiation.
    ContractFinalization,
    /// Either side ends a negotiation.
    ContractTermination,
}

/// Message addressed to a counter-party connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    /// Message kind.
    pub kind: MessageKind,
    /// Local process or negotiation id.
    pub process_id: String,
    /// Counter-party endpoint.
    pub counter_party_address: String,
    /// Protocol identifier (e.g. `dataspace-protocol-http`).
    pub protocol: String,
    /// Message body.
    #[serde(default)]
    pub payload: Value,
}

/// Sends protocol messages to counter-parties.
#[async_trait]
pub trait RemoteMessageDispatcher: Send + Sync {
    /// Deliver `message`; an error means the counter-party did not accept it.
    async fn dispatch(&self, message: RemoteMessage) -> Result<()>;
}

/// Decides whether an in-progress transfer has finished.
#[async_trait]
pub trait StatusChecker: Send + Sync {
    /// Whether the transfer `process_id` of `transfer_type` is complete.
    async fn is_complete(&self, process_id: &str, transfer_type: &str) -> Result<bool>;
}

/// Messages a [`RecordingDispatcher`] keeps by default.
pub const DEFAULT_RECORDING_CAPACITY: usize = 10_000;

/// Dispatcher that records messages instead of sending them.
///
/// Useful for tests and for running a connector without peers. Only the most
/// recent `capacity` messages are kept.
#[derive(Clone)]
pub struct RecordingDispatcher {
    sent: Arc<Mutex<VecDeque<RemoteMessage>>>,
    failures: Arc<Mutex<Vec<String>>>,
    capacity: usize,
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RECORDING_CAPACITY)
    }
}

impl RecordingDispatcher {
    /// Dispatcher accepting every message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher keeping at most `capacity` messages, oldest dropped first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sent: Arc::new(Mutex::new(VecDeque::new())),
            failures: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    /// Reject every message to `address` until [`heal`](Self::heal) is called.
    pub async fn fail_address(&self, address: impl Into<String>) {
        self.failures.lock().await.push(address.into());
    }

    /// Accept messages to every address again.
    pub async fn heal(&self) {
        self.failures.lock().await.clear();
    }

    /// Retained accepted messages, oldest first.
    pub async fn sent(&self) -> Vec<RemoteMessage> {
        self.sent.lock().await.iter().cloned().collect()
    }

    /// Retained accepted messages of `kind` for `process_id`.
    pub async fn sent_for(&self, process_id: &str, kind: MessageKind) -> usize {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| m.process_id == process_id && m.kind == kind)
            .count()
    }
}

#[async_trait]
impl RemoteMessageDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: RemoteMessage) -> Result<()> {
        if self
            .failures
            .lock()
            .await
            .contains(&message.counter_party_address)
        {
            return Err(Error::Dispatch {
                address: message.counter_party_address,
                message: "counter-party unreachable".to_string(),
            });
        }
        let mut sent = self.sent.lock().await;
        if sent.len() == self.capacity {
            sent.pop_front();
        }
        sent.push_back(message);
        Ok(())
    }
}
