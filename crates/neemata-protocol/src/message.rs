// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed messages carried on the supervisor/worker channel.
//!
//! Control messages (`Ready`, `Start`, `Stop`) have empty payloads. Task
//! offload messages carry a correlation id so replies can be matched to the
//! originating worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::frame::{Frame, FrameError, MessageKind};
use crate::wire::WireError;

/// Task execution request, routed api-worker → supervisor → task-worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteInvoke {
    pub correlation_id: Uuid,
    pub task_name: String,
    pub args: Vec<Value>,
}

/// Task execution outcome, routed task-worker → supervisor → api-worker.
///
/// Exactly one of `output`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub correlation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ExecuteResult {
    pub fn ok(correlation_id: Uuid, output: Value) -> Self {
        Self {
            correlation_id,
            output: Some(output),
            error: None,
        }
    }

    pub fn err(correlation_id: Uuid, error: WireError) -> Self {
        Self {
            correlation_id,
            output: None,
            error: Some(error),
        }
    }
}

/// Best-effort cancellation of an in-flight execution, supervisor → task-worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteAbort {
    pub correlation_id: Uuid,
}

/// A message on the supervisor/worker channel.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Ready,
    Start,
    Stop,
    ExecuteInvoke(ExecuteInvoke),
    ExecuteResult(ExecuteResult),
    ExecuteAbort(ExecuteAbort),
}

impl WorkerMessage {
    /// The frame kind this message is carried under.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ready => MessageKind::Ready,
            Self::Start => MessageKind::Start,
            Self::Stop => MessageKind::Stop,
            Self::ExecuteInvoke(_) => MessageKind::ExecuteInvoke,
            Self::ExecuteResult(_) => MessageKind::ExecuteResult,
            Self::ExecuteAbort(_) => MessageKind::ExecuteAbort,
        }
    }

    /// Encode this message into a frame.
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        match self {
            Self::Ready | Self::Start | Self::Stop => Ok(Frame::bare(self.kind())),
            Self::ExecuteInvoke(msg) => Frame::new(MessageKind::ExecuteInvoke, msg),
            Self::ExecuteResult(msg) => Frame::new(MessageKind::ExecuteResult, msg),
            Self::ExecuteAbort(msg) => Frame::new(MessageKind::ExecuteAbort, msg),
        }
    }

    /// Decode a message from a frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        match frame.kind {
            MessageKind::Ready => Ok(Self::Ready),
            MessageKind::Start => Ok(Self::Start),
            MessageKind::Stop => Ok(Self::Stop),
            MessageKind::ExecuteInvoke => Ok(Self::ExecuteInvoke(frame.decode()?)),
            MessageKind::ExecuteResult => Ok(Self::ExecuteResult(frame.decode()?)),
            MessageKind::ExecuteAbort => Ok(Self::ExecuteAbort(frame.decode()?)),
        }
    }
}
