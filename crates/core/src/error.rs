// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for Castflow.
//!
//! This module provides a hierarchy of error types for better error handling
//! and programmatic error inspection. All errors implement `Display` and can
//! be converted to/from `String` for backward compatibility.

use thiserror::Error;

/// Main error type for Castflow operations.
///
/// This enum categorizes errors into distinct types to enable better error
/// handling, logging, and recovery strategies. Each variant includes a
/// descriptive message.
#[derive(Debug, Error)]
pub enum CastflowError {
    /// A module constructor rejected its configuration.
    ///
    /// Examples:
    /// - Invalid module parameters (zero segment duration, negative rate)
    /// - Missing required configuration fields
    /// - Inconsistent flag combinations
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The registry has no module with the requested name.
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    /// A module name was registered twice.
    #[error("Duplicate module registration: {0}")]
    DuplicateRegistration(String),

    /// Stream-type mismatch detected at connect time or while a packet was
    /// delivered. Not recoverable: the topology is wrong.
    #[error("Incompatible metadata: {0}")]
    IncompatibleMetadata(String),

    /// Graph manipulation error: removing a connected module, disconnecting
    /// a non-existing edge, addressing a port that does not exist.
    #[error("Topology error: {0}")]
    TopologyError(String),

    /// Runtime processing error during normal operation.
    ///
    /// Examples:
    /// - A collaborator module failed to process a packet
    /// - Data format conversion failure
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O error (file operations, device access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `CastflowError`.
pub type Result<T> = std::result::Result<T, CastflowError>;

// Backward compatibility: Allow conversion from CastflowError to String
impl From<CastflowError> for String {
    fn from(err: CastflowError) -> Self {
        err.to_string()
    }
}

// Generic string errors default to Runtime
impl From<String> for CastflowError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for CastflowError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}
