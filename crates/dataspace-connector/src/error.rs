// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for dataspace-connector.

use dataspace_core::EngineError;
use thiserror::Error;

/// Connector errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Engine operation (store, queue, registry) failed.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Sending a message to the counter-party failed.
    #[error("Dispatch to '{address}' failed: {message}")]
    Dispatch {
        /// Counter-party address.
        address: String,
        /// Cause.
        message: String,
    },

    /// A data plane did not answer its health probe.
    #[error("Data plane '{url}' unreachable: {message}")]
    Unreachable {
        /// Probed URL.
        url: String,
        /// Cause.
        message: String,
    },

    /// No available data plane can serve the request.
    #[error(
        "No data plane available for source '{source_type}' and transfer type '{transfer_type}'"
    )]
    NoDataPlane {
        /// Requested source type.
        source_type: String,
        /// Requested transfer type.
        transfer_type: String,
    },

    /// Selection strategy is not registered.
    #[error("Unknown selection strategy: {0}")]
    UnknownStrategy(String),

    /// A selection strategy with this name is already registered.
    #[error("Duplicate selection strategy: {0}")]
    DuplicateStrategy(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Engine(e) => e.error_code(),
            Self::Dispatch { .. } => "DISPATCH_FAILED",
            Self::Unreachable { .. } => "DATA_PLANE_UNREACHABLE",
            Self::NoDataPlane { .. } => "NO_DATA_PLANE",
            Self::UnknownStrategy(_) => "UNKNOWN_STRATEGY",
            Self::DuplicateStrategy(_) => "DUPLICATE_STRATEGY",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

/// Result type using connector Error.
pub type Result<T> = std::result::Result<T, Error>;
