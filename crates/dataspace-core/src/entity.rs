// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stateful entity model shared by every workflow.
//!
//! Workflow entities (transfer processes, contract negotiations, data-plane
//! instances) embed an [`EntityMeta`] with `#[serde(flatten)]` and implement
//! [`StatefulEntity`]. The engine only ever reads and writes the metadata;
//! the rest of the entity is opaque to it.
//!
//! # Retry counter
//!
//! ```text
//!   transition_to(S) while in S      -> state_count + 1, timestamp bumped
//!   transition_to(T) while in S != T -> state_count = 0, timestamp bumped
//!   record_failed_attempt(msg)       -> state_count + 1, timestamp kept
//! ```

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Key under which a W3C trace parent is carried in [`EntityMeta::trace_context`].
pub const TRACEPARENT: &str = "traceparent";

/// Current time truncated to the millisecond precision entities persist with.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Finite state set of one workflow.
pub trait EntityState: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Persisted integer code.
    fn code(self) -> i32;

    /// Resolve a persisted code back into the state, if known.
    fn from_code(code: i32) -> Option<Self>;

    /// Whether no further transitions are expected from this state.
    fn is_terminal(self) -> bool;
}

/// Engine-visible metadata of a stateful entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    /// Stable identifier, immutable after creation.
    pub id: String,
    /// Current workflow state code.
    pub state: i32,
    /// Number of consecutive attempts in the current state.
    #[serde(default)]
    pub state_count: u32,
    /// Last time the state changed.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub state_timestamp: DateTime<Utc>,
    /// When the entity was created.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Last time anything on the entity changed.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Cause of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Opaque observability carrier, propagated but never interpreted.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub trace_context: HashMap<String, String>,
    /// Entity waits for an out-of-band event before it can progress.
    #[serde(default)]
    pub pending: bool,
}

impl EntityMeta {
    /// Create metadata for a new entity in `state`.
    pub fn new(id: impl Into<String>, state: i32) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            state,
            state_count: 0,
            state_timestamp: now,
            created_at: now,
            updated_at: now,
            error_detail: None,
            trace_context: HashMap::new(),
            pending: false,
        }
    }

    /// Override the state timestamp (used when importing entities).
    pub fn with_state_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.state_timestamp = timestamp;
        self
    }

    /// Attach a trace context entry.
    pub fn with_trace(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.trace_context.insert(key.into(), value.into());
        self
    }

    fn transition_to(&mut self, state: i32) {
        let now = now_millis();
        if self.state == state {
            self.state_count += 1;
        } else {
            self.state = state;
            self.state_count = 0;
            self.error_detail = None;
        }
        self.state_timestamp = now;
        self.updated_at = now;
    }

    fn record_failed_attempt(&mut self, detail: impl Into<String>) {
        self.state_count += 1;
        self.error_detail = Some(detail.into());
        self.updated_at = now_millis();
    }
}

/// An entity driven through a workflow by the state machine engine.
pub trait StatefulEntity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// The workflow's state set.
    type State: EntityState;

    /// Discriminator used to partition shared SQL tables.
    const ENTITY_TYPE: &'static str;

    /// Engine metadata.
    fn meta(&self) -> &EntityMeta;

    /// Mutable engine metadata.
    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// Entity identifier.
    fn id(&self) -> &str {
        &self.meta().id
    }

    /// Raw state code.
    fn state_code(&self) -> i32 {
        self.meta().state
    }

    /// Typed state, `None` if the persisted code is unknown.
    fn state(&self) -> Option<Self::State> {
        Self::State::from_code(self.meta().state)
    }

    /// Consecutive attempts in the current state.
    fn state_count(&self) -> u32 {
        self.meta().state_count
    }

    /// Last state change.
    fn state_timestamp(&self) -> DateTime<Utc> {
        self.meta().state_timestamp
    }

    /// Move to `state`; re-entering the current state counts as a retry.
    fn transition_to(&mut self, state: Self::State) {
        self.meta_mut().transition_to(state.code());
    }

    /// Count a failed attempt in the current state without changing it.
    fn record_failed_attempt(&mut self, detail: impl Into<String>) {
        self.meta_mut().record_failed_attempt(detail);
    }

    /// Record a terminal error and move to `state`.
    fn fail_with(&mut self, state: Self::State, detail: impl Into<String>) {
        self.meta_mut().transition_to(state.code());
        self.meta_mut().error_detail = Some(detail.into());
    }

    /// Flag the entity as waiting for an out-of-band event.
    fn set_pending(&mut self, pending: bool) {
        self.meta_mut().pending = pending;
        self.meta_mut().updated_at = now_millis();
    }

    /// Whether the entity waits for an out-of-band event.
    fn is_pending(&self) -> bool {
        self.meta().pending
    }

    /// Last failure cause.
    fn error_detail(&self) -> Option<&str> {
        self.meta().error_detail.as_deref()
    }

    /// Trace carrier.
    fn trace_context(&self) -> &HashMap<String, String> {
        &self.meta().trace_context
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal entity used by the engine's unit tests.

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum JobState {
        Queued,
        Running,
        Done,
        Failed,
    }

    impl EntityState for JobState {
        fn code(self) -> i32 {
            match self {
                Self::Queued => 100,
                Self::Running => 200,
                Self::Done => 300,
                Self::Failed => -1,
            }
        }

        fn from_code(code: i32) -> Option<Self> {
            match code {
                100 => Some(Self::Queued),
                200 => Some(Self::Running),
                300 => Some(Self::Done),
                -1 => Some(Self::Failed),
                _ => None,
            }
        }

        fn is_terminal(self) -> bool {
            matches!(self, Self::Done | Self::Failed)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Job {
        #[serde(flatten)]
        pub meta: EntityMeta,
        pub owner: String,
        #[serde(default)]
        pub tags: Vec<String>,
    }

    impl Job {
        pub fn new(id: &str, state: JobState) -> Self {
            Self {
                meta: EntityMeta::new(id, state.code()),
                owner: "alice".to_string(),
                tags: Vec::new(),
            }
        }

        /// Job whose state timestamp lies `offset_ms` after a fixed epoch.
        pub fn aged(id: &str, state: JobState, offset_ms: i64) -> Self {
            let mut job = Self::new(id, state);
            let base = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default();
            job.meta.state_timestamp = base + chrono::Duration::milliseconds(offset_ms);
            job
        }
    }

    impl StatefulEntity for Job {
        type State = JobState;
        const ENTITY_TYPE: &'static str = "job";

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }
}
