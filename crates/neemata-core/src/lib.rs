// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Neemata Core - worker runtime
//!
//! The runtime hosted by every worker process: a scoped dependency-injection
//! container, a registry of modules/procedures/tasks/commands, a lifecycle
//! hook engine, procedure dispatch with deadlines and cooperative
//! cancellation, a task engine with cross-worker offload, pub/sub
//! subscriptions and per-connection binary streams.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Application                           │
//! ├──────────────┬──────────────┬───────────────┬──────────────┤
//! │  Dispatcher  │  TaskEngine  │ Subscriptions │   Streams    │
//! ├──────────────┴──────────────┴───────────────┴──────────────┤
//! │        Registry · HookEngine · FormatSelector               │
//! ├─────────────────────────────────────────────────────────────┤
//! │           Container (Global ⊃ Connection ⊃ Call)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transports and serialization formats are external collaborators: they
//! implement [`Transport`]/[`Format`] and talk to the runtime through the
//! narrow [`ExtensionHost`] surface.
//!
//! # Usage
//!
//! ```ignore
//! use neemata_core::{Application, Config, Module, Procedure, WorkerData, WorkerKind};
//!
//! let app = Application::new(Config::from_env()?, WorkerData::from_env()?);
//! app.register_module(
//!     Module::new("math").procedure(Procedure::build("echo").handler(handler)),
//! )?;
//! app.start().await?;
//! ```

pub mod application;
pub mod config;
pub mod container;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod format;
pub mod hooks;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod scope;
pub mod streams;
pub mod subscriptions;
pub mod tasks;
pub mod transport;
pub mod worker;

pub use application::{Application, LifecycleState};
pub use config::{Config, ConfigError, WorkerData, WorkerKind};
pub use container::Container;
pub use context::{CallContext, TaskContext};
pub use dispatcher::{ApiDispatcher, RpcCall, RpcReply};
pub use error::{CoreError, Result};
pub use format::{Format, FormatSelector, JsonFormat};
pub use hooks::{HookCallOptions, HookContext, HookEngine, HookFn, HookKind};
pub use provider::{AnyProvider, FactoryContext, Provider};
pub use registry::{
    CommandFn, GuardFn, HandlerFn, MiddlewareFn, Module, NextFn, Procedure, Registry,
    RegistryView, Task, TaskFn,
};
pub use schema::{FieldIssue, Schema};
pub use scope::Scope;
pub use streams::{StreamMeta, StreamState, StreamTable, UpstreamReader};
pub use subscriptions::{BasicSubscriptions, FilterFn, SubscriptionManager};
pub use tasks::TaskEngine;
pub use transport::{Connection, ConnectionHandle, ConnectionId, ExtensionHost, Transport};
pub use worker::{run_worker, run_worker_stdio};
