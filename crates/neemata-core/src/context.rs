// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation contexts for procedures and tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::container::Container;
use crate::error::Result;
use crate::provider::Provider;
use crate::transport::ConnectionHandle;

/// Context of one RPC invocation.
///
/// One per call; owns the call-scope container and the cancellation signal
/// handlers are expected to observe cooperatively.
pub struct CallContext {
    connection: ConnectionHandle,
    procedure: String,
    started: Instant,
    cancellation: CancellationToken,
    container: Container,
}

impl CallContext {
    pub(crate) fn new(
        connection: ConnectionHandle,
        procedure: String,
        cancellation: CancellationToken,
        container: Container,
    ) -> Self {
        Self {
            connection,
            procedure,
            started: Instant::now(),
            cancellation,
            container,
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Full name of the procedure being invoked.
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Time since dispatch began.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Cancelled on client disconnect, timeout, or shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The call-scope container.
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Resolve a provider in the call scope.
    pub async fn resolve<T: Send + Sync + 'static>(
        &self,
        provider: &Provider<T>,
    ) -> Result<Arc<T>> {
        self.container.resolve(provider).await
    }
}

/// Context of one task execution.
pub struct TaskContext {
    task: String,
    cancellation: CancellationToken,
    container: Container,
}

impl TaskContext {
    pub(crate) fn new(task: String, cancellation: CancellationToken, container: Container) -> Self {
        Self {
            task,
            cancellation,
            container,
        }
    }

    /// Full name of the running task.
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Raised on deadline expiry or worker shutdown; cancellation is
    /// cooperative.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub async fn resolve<T: Send + Sync + 'static>(
        &self,
        provider: &Provider<T>,
    ) -> Result<Arc<T>> {
        self.container.resolve(provider).await
    }
}
