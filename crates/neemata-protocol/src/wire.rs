// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-facing frame envelope and wire error shape.
//!
//! Transports decode their own framing into [`ClientFrame`] values and hand
//! them to the worker runtime; responses travel the same envelope in the
//! other direction.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame kinds exchanged between clients and an api worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientFrameKind {
    /// Procedure call or its response
    Rpc = 1,
    /// Open a binary stream (metadata payload)
    StreamOpen = 2,
    /// A chunk of stream data
    StreamData = 3,
    /// Normal end of a stream
    StreamEnd = 4,
    /// Abnormal stream termination
    StreamAbort = 5,
    /// Server-pushed event on a subscribed channel
    SubscriptionEvent = 6,
    /// Connection-level error
    Error = 7,
}

impl TryFrom<u8> for ClientFrameKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(Self::Rpc),
            2 => Ok(Self::StreamOpen),
            3 => Ok(Self::StreamData),
            4 => Ok(Self::StreamEnd),
            5 => Ok(Self::StreamAbort),
            6 => Ok(Self::SubscriptionEvent),
            7 => Ok(Self::Error),
            other => Err(other),
        }
    }
}

/// One frame of client traffic, as seen by the worker runtime.
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub kind: ClientFrameKind,
    pub payload: Bytes,
}

impl ClientFrame {
    pub fn new(kind: ClientFrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Error shape surfaced to clients: `{code, message, data?}`.
///
/// `message` is the code concatenated with any human text, so the field a
/// client reads carries the kind even without inspecting `code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WireError {
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let detail = detail.into();
        let message = if detail.is_empty() {
            code.clone()
        } else {
            format!("{}: {}", code, detail)
        };
        Self {
            code,
            message,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The human text without the leading code prefix.
    pub fn detail(&self) -> &str {
        self.message
            .strip_prefix(&self.code)
            .map(|rest| rest.strip_prefix(": ").unwrap_or(rest))
            .unwrap_or(&self.message)
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for WireError {}
