// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Neemata Protocol - framing and message envelopes
//!
//! This crate provides the wire layer shared by the supervisor and its
//! workers, and the frame envelope transports hand to the worker runtime:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    neemata-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Worker channel: Ready/Start/Stop/ExecuteInvoke/...         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Client envelope: Rpc/Stream*/SubscriptionEvent frames      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: 4-byte length + 2-byte kind + payload             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The worker channel is a length-prefixed binary pipe between the
//! supervisor process and each worker's stdio. One frame carries one
//! message; payloads are JSON-encoded.
//!
//! # Usage
//!
//! ```ignore
//! use neemata_protocol::{Frame, WorkerMessage, read_frame, write_frame};
//!
//! let msg = WorkerMessage::Ready;
//! write_frame(&mut writer, &msg.to_frame()?).await?;
//!
//! let frame = read_frame(&mut reader).await?;
//! let msg = WorkerMessage::from_frame(&frame)?;
//! ```

pub mod frame;
pub mod message;
pub mod wire;

pub use frame::{
    DEFAULT_MAX_FRAME_SIZE, Frame, FrameError, FramedChannel, HEADER_SIZE, MessageKind,
    max_frame_size, read_frame, write_frame,
};
pub use message::{ExecuteAbort, ExecuteInvoke, ExecuteResult, WorkerMessage};
pub use wire::{ClientFrame, ClientFrameKind, WireError};
