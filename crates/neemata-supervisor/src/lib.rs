// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Neemata Supervisor - worker pool management
//!
//! The parent process of a neemata deployment: spawns api and task worker
//! processes, runs the readiness handshake, routes task offloads between
//! workers over framed stdio channels, replaces crashed workers and
//! coordinates graceful shutdown.
//!
//! ```text
//!                 ┌──────────────┐
//!                 │  Supervisor  │
//!                 └──┬───────┬───┘
//!          Ready/Start│       │ExecuteInvoke → round robin
//!           ┌─────────┴──┐ ┌──┴──────────┐
//!           │ api worker │ │ task worker │
//!           └────────────┘ └─────────────┘
//! ```

pub mod pool;
pub mod router;
pub mod supervisor;
pub mod worker;

pub use pool::Pool;
pub use router::{Route, Router};
pub use supervisor::Supervisor;
pub use worker::{
    SlotKey, SupervisorError, SupervisorEvent, WorkerCommand, WorkerSlot, WorkerState,
};
