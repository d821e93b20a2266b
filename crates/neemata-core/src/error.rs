// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for neemata-core.
//!
//! Provides a unified error type that maps to client wire errors. Kinds that
//! are not surfaced to clients (lifecycle and registration failures) are
//! still carried here so callers can log them uniformly.

use std::fmt;

use neemata_protocol::WireError;

use crate::schema::FieldIssue;
use crate::scope::Scope;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during request processing and lifecycle.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Procedure, task or command is not registered.
    NotFound {
        /// The name that was looked up.
        name: String,
    },

    /// Input or output failed schema validation.
    Validation {
        /// Per-field validation issues.
        issues: Vec<FieldIssue>,
    },

    /// Payload could not be decoded.
    InvalidPayload {
        /// The reason decoding failed.
        reason: String,
    },

    /// A guard rejected the call.
    Forbidden {
        /// Optional guard-provided reason.
        reason: Option<String>,
    },

    /// Procedure deadline elapsed.
    Timeout,

    /// Task deadline elapsed.
    TaskTimeout,

    /// Task worker crashed while the call was in flight.
    TaskWorkerLost,

    /// Stream terminated abnormally.
    StreamAborted {
        /// The stream id.
        stream_id: u32,
    },

    /// Lifecycle precondition not met.
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the application was in.
        state: String,
    },

    /// Provider resolved in a container of an incompatible scope.
    ScopeMismatch {
        /// The provider description.
        provider: String,
        /// The provider's declared scope.
        provider_scope: Scope,
        /// The scope of the resolving container.
        container_scope: Scope,
    },

    /// Registration conflict within a namespace.
    DuplicateName {
        /// The colliding name.
        name: String,
    },

    /// Unhandled internal error.
    Internal {
        /// Error details (not surfaced verbatim to clients).
        message: String,
    },
}

impl CoreError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the error code string for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Timeout => "TIMEOUT",
            Self::TaskTimeout => "TASK_TIMEOUT",
            Self::TaskWorkerLost => "TASK_WORKER_LOST",
            Self::StreamAborted { .. } => "STREAM_ABORTED",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::ScopeMismatch { .. } => "SCOPE_MISMATCH",
            Self::DuplicateName { .. } => "DUPLICATE_NAME",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether this kind is surfaced to clients at all.
    pub fn is_surfaced(&self) -> bool {
        !matches!(
            self,
            Self::InvalidState { .. } | Self::ScopeMismatch { .. } | Self::DuplicateName { .. }
        )
    }

    /// Convert this error to the client wire shape.
    ///
    /// Internal errors are sanitized: the detail stays in the logs only.
    pub fn to_wire(&self) -> WireError {
        match self {
            Self::Internal { .. } => WireError::new("INTERNAL", "internal error"),
            Self::Validation { issues } => WireError::new("VALIDATION_ERROR", self.to_string())
                .with_data(serde_json::json!({ "issues": issues })),
            other => WireError::new(other.error_code(), other.to_string()),
        }
    }

    /// Map a wire error received from another worker back to a kind.
    ///
    /// Unknown codes become `Internal` with the remote message preserved.
    pub fn from_wire(error: &WireError) -> Self {
        match error.code.as_str() {
            "NOT_FOUND" => Self::NotFound {
                name: error.detail().to_string(),
            },
            "TIMEOUT" => Self::Timeout,
            "TASK_TIMEOUT" => Self::TaskTimeout,
            "TASK_WORKER_LOST" => Self::TaskWorkerLost,
            "FORBIDDEN" => Self::Forbidden {
                reason: Some(error.detail().to_string()),
            },
            "INVALID_PAYLOAD" => Self::InvalidPayload {
                reason: error.detail().to_string(),
            },
            _ => Self::Internal {
                message: error.to_string(),
            },
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => {
                write!(f, "'{}' is not registered", name)
            }
            Self::Validation { issues } => {
                write!(f, "validation failed for {} field(s)", issues.len())
            }
            Self::InvalidPayload { reason } => {
                write!(f, "payload could not be decoded: {}", reason)
            }
            Self::Forbidden { reason } => match reason {
                Some(reason) => write!(f, "call rejected: {}", reason),
                None => write!(f, "call rejected"),
            },
            Self::Timeout => write!(f, "procedure deadline exceeded"),
            Self::TaskTimeout => write!(f, "task deadline exceeded"),
            Self::TaskWorkerLost => write!(f, "task worker crashed mid-call"),
            Self::StreamAborted { stream_id } => {
                write!(f, "stream {} terminated abnormally", stream_id)
            }
            Self::InvalidState { operation, state } => {
                write!(f, "cannot {} while '{}'", operation, state)
            }
            Self::ScopeMismatch {
                provider,
                provider_scope,
                container_scope,
            } => {
                write!(
                    f,
                    "provider '{}' of scope {} cannot resolve in {} container",
                    provider, provider_scope, container_scope
                )
            }
            Self::DuplicateName { name } => {
                write!(f, "'{}' is already registered", name)
            }
            Self::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}
