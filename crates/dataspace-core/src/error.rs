// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for dataspace-core.
//!
//! Every failure the engine can observe maps onto one [`EngineError`] variant.
//! The scheduling loop never propagates these; they are logged and folded into
//! the tick's processed count.

use thiserror::Error;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors raised by stores, processors, command handling and provisioning.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Entity was not found in the store.
    #[error("Entity '{entity_id}' not found")]
    NotFound {
        /// The entity ID that was not found.
        entity_id: String,
    },

    /// Entity already exists (duplicate create).
    #[error("Entity '{entity_id}' already exists")]
    AlreadyExists {
        /// The entity ID that already exists.
        entity_id: String,
    },

    /// Optimistic-concurrency violation on save: the caller no longer holds a
    /// valid lease, another runtime progressed the entity.
    #[error("Lease conflict on entity '{entity_id}': lease held by '{leased_by}'")]
    LeaseConflict {
        /// The entity ID.
        entity_id: String,
        /// Current (or last) lease holder.
        leased_by: String,
    },

    /// A valid lease is held by another runtime.
    #[error("Entity '{entity_id}' is already leased by '{leased_by}'")]
    AlreadyLeased {
        /// The entity ID.
        entity_id: String,
        /// Current lease holder.
        leased_by: String,
    },

    /// The bounded command queue rejected a command.
    #[error("Command queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// A handler for this command type was already registered.
    #[error("Duplicate handler registration for command type '{command_type}'")]
    DuplicateHandler {
        /// The command type name.
        command_type: String,
    },

    /// No handler registered for the command type.
    #[error("No handler registered for command type '{command_type}'")]
    HandlerNotFound {
        /// The command type name.
        command_type: String,
    },

    /// A workflow transition function failed.
    #[error("Transition failed for entity '{entity_id}': {message}")]
    Transition {
        /// The entity ID.
        entity_id: String,
        /// Failure cause.
        message: String,
    },

    /// A query could not be evaluated or translated.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database operation failed.
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[cfg(feature = "sqlite")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl EngineError {
    /// Shorthand for a transition failure.
    pub fn transition(entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transition {
            entity_id: entity_id.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::LeaseConflict { .. } => "LEASE_CONFLICT",
            Self::AlreadyLeased { .. } => "ALREADY_LEASED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::DuplicateHandler { .. } => "DUPLICATE_HANDLER",
            Self::HandlerNotFound { .. } => "HANDLER_NOT_FOUND",
            Self::Transition { .. } => "TRANSITION_FAILED",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            #[cfg(feature = "sqlite")]
            Self::Database(_) => "DATABASE_ERROR",
            #[cfg(feature = "sqlite")]
            Self::Migration(_) => "MIGRATION_ERROR",
        }
    }

    /// Whether retrying the same unit of work later can succeed.
    ///
    /// Lease conflicts are not retryable: another runtime progressed the
    /// entity and the local copy must be discarded. Unresolvable dispatch and
    /// configuration errors are fatal for the unit of work.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AlreadyLeased { .. } | Self::Transition { .. } => true,
            #[cfg(feature = "sqlite")]
            Self::Database(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = EngineError::NotFound {
            entity_id: "tp-1".to_string(),
        };
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert_eq!(err.to_string(), "Entity 'tp-1' not found");

        let err = EngineError::QueueFull { capacity: 10 };
        assert_eq!(err.error_code(), "QUEUE_FULL");
        assert_eq!(err.to_string(), "Command queue is full (capacity 10)");
    }

    #[test]
    fn test_retry_classification() {
        assert!(EngineError::transition("e1", "boom").is_retryable());
        assert!(
            EngineError::AlreadyLeased {
                entity_id: "e1".to_string(),
                leased_by: "other".to_string(),
            }
            .is_retryable()
        );
        assert!(
            !EngineError::LeaseConflict {
                entity_id: "e1".to_string(),
                leased_by: "other".to_string(),
            }
            .is_retryable()
        );
        assert!(
            !EngineError::HandlerNotFound {
                command_type: "Cancel".to_string(),
            }
            .is_retryable()
        );
    }
}
