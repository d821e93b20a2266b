// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport and extension interfaces.
//!
//! Concrete transports live outside the core. They accept sockets, decode
//! their own framing into [`ClientFrame`] values and drive them through the
//! narrow [`ExtensionHost`] interface; the host never hands out the whole
//! application.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use neemata_protocol::ClientFrame;

use crate::container::Container;
use crate::error::Result;
use crate::format::FormatSelector;
use crate::registry::RegistryView;
use crate::streams::StreamTable;

/// Opaque connection identifier.
pub type ConnectionId = Uuid;

/// A connected client, as tracked by the worker runtime.
pub struct Connection {
    id: ConnectionId,
    content_type: String,
    sender: mpsc::Sender<ClientFrame>,
    container: Container,
    cancellation: CancellationToken,
    streams: StreamTable,
}

/// Shared handle to a connection.
pub type ConnectionHandle = Arc<Connection>;

impl Connection {
    pub(crate) fn new(
        content_type: String,
        sender: mpsc::Sender<ClientFrame>,
        container: Container,
        streams: StreamTable,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_type,
            sender,
            container,
            cancellation: CancellationToken::new(),
            streams,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Content type negotiated by the transport for this connection.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Outbound frame channel towards the transport.
    pub fn sender(&self) -> &mpsc::Sender<ClientFrame> {
        &self.sender
    }

    /// The connection-scope container.
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Cancelled when the connection dies.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Stream bookkeeping for this connection.
    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// A pluggable transport.
///
/// Transports terminate their own protocol (HTTP, WebSocket, TCP, ...) and
/// translate between it and [`ClientFrame`]s. They are started on api
/// workers during application start and stopped during shutdown.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Begin accepting connections, reporting them through `host`.
    async fn start(&self, host: Arc<dyn ExtensionHost>) -> Result<()>;

    /// Stop accepting and close existing connections.
    async fn stop(&self) -> Result<()>;
}

/// The narrow surface the runtime exposes to transports and extensions.
#[async_trait]
pub trait ExtensionHost: Send + Sync {
    /// The format selector for payload encode/decode.
    fn format(&self) -> Arc<FormatSelector>;

    /// Read-only registry access.
    fn registry(&self) -> RegistryView;

    /// Register a new connection. `sender` is the transport's outbound frame
    /// channel; the returned handle is used for all further calls.
    async fn add_connection(
        &self,
        content_type: &str,
        sender: mpsc::Sender<ClientFrame>,
    ) -> Result<ConnectionHandle>;

    /// Remove a connection: subscriptions are dropped, streams aborted,
    /// disconnection hooks fired, the connection scope disposed.
    async fn remove_connection(&self, id: ConnectionId);

    /// Look up a live connection.
    fn get_connection(&self, id: ConnectionId) -> Option<ConnectionHandle>;

    /// Dispatch one inbound frame. Responses are pushed through the
    /// connection's sender; RPC handlers may still be running when this
    /// returns.
    async fn handle_frame(&self, connection: &ConnectionHandle, frame: ClientFrame) -> Result<()>;
}
