// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application wiring and lifecycle.
//!
//! An [`Application`] owns the registry, the global container, the hook
//! engine, the dispatcher, the task engine and the subscription manager,
//! and drives the initialize/start/stop/terminate sequence. It also
//! implements [`ExtensionHost`], the narrow surface handed to transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use neemata_protocol::{ClientFrame, ClientFrameKind};

use crate::config::{Config, WorkerData, WorkerKind};
use crate::container::Container;
use crate::dispatcher::ApiDispatcher;
use crate::error::{CoreError, Result};
use crate::format::FormatSelector;
use crate::hooks::{HookCallOptions, HookContext, HookEngine, HookFn, HookKind};
use crate::provider::{AnyProvider, Provider};
use crate::registry::{CommandFn, Module, Registry, RegistryView};
use crate::scope::Scope;
use crate::streams::StreamTable;
use crate::subscriptions::{BasicSubscriptions, SubscriptionManager};
use crate::tasks::TaskEngine;
use crate::transport::{Connection, ConnectionHandle, ConnectionId, ExtensionHost, Transport};

/// Application lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initializing,
    Initialized,
    Starting,
    Running,
    Stopping,
    Terminating,
    Terminated,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

struct AppInner {
    config: Config,
    worker: WorkerData,
    state: Mutex<LifecycleState>,
    registry: Arc<RwLock<Registry>>,
    hooks: HookEngine,
    container: Container,
    format: Arc<FormatSelector>,
    subscriptions: Mutex<Arc<dyn SubscriptionManager>>,
    transports: Mutex<Vec<Arc<dyn Transport>>>,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    dispatcher: Arc<ApiDispatcher>,
    tasks: Arc<TaskEngine>,
    eager: Mutex<Vec<AnyProvider>>,
    aborted_streams: Arc<AtomicU64>,
}

/// The worker runtime.
#[derive(Clone)]
pub struct Application {
    inner: Arc<AppInner>,
}

impl Application {
    pub fn new(config: Config, worker: WorkerData) -> Self {
        let registry = Arc::new(RwLock::new(Registry::new()));
        let view = RegistryView::new(registry.clone());
        let container = Container::new(Scope::Global);
        let format = Arc::new(FormatSelector::default());

        let dispatcher = Arc::new(ApiDispatcher::new(
            view.clone(),
            format.clone(),
            config.api_timeout,
        ));
        let tasks = Arc::new(TaskEngine::new(
            worker,
            view,
            container.clone(),
            config.tasks_timeout,
        ));
        let subscriptions: Arc<dyn SubscriptionManager> =
            Arc::new(BasicSubscriptions::new(format.clone()));

        Self {
            inner: Arc::new(AppInner {
                config,
                worker,
                state: Mutex::new(LifecycleState::Created),
                registry,
                hooks: HookEngine::new(),
                container,
                format,
                subscriptions: Mutex::new(subscriptions),
                transports: Mutex::new(Vec::new()),
                connections: Mutex::new(HashMap::new()),
                dispatcher,
                tasks,
                eager: Mutex::new(Vec::new()),
                aborted_streams: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    pub fn worker(&self) -> WorkerData {
        self.inner.worker
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The global-scope container.
    pub fn container(&self) -> &Container {
        &self.inner.container
    }

    pub fn dispatcher(&self) -> &Arc<ApiDispatcher> {
        &self.inner.dispatcher
    }

    pub fn tasks(&self) -> &Arc<TaskEngine> {
        &self.inner.tasks
    }

    pub fn subscriptions(&self) -> Arc<dyn SubscriptionManager> {
        self.inner
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .clone()
    }

    /// Total streams aborted on this worker.
    pub fn aborted_streams(&self) -> u64 {
        self.inner.aborted_streams.load(Ordering::Relaxed)
    }

    /// Replace the subscription manager. The manager is fixed once
    /// initialization begins.
    pub fn with_subscriptions(&self, manager: Arc<dyn SubscriptionManager>) -> Result<()> {
        let state = self.state();
        if state != LifecycleState::Created {
            let err = CoreError::InvalidState {
                operation: "replace the subscription manager",
                state: state.to_string(),
            };
            error!(%err, "subscription manager replacement rejected");
            return Err(err);
        }
        *self
            .inner
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned") = manager;
        Ok(())
    }

    pub fn register_module(&self, module: Module) -> Result<()> {
        self.inner
            .registry
            .write()
            .expect("registry lock poisoned")
            .register_module(module)
    }

    pub fn register_command(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        command: CommandFn,
    ) -> Result<()> {
        self.inner
            .registry
            .write()
            .expect("registry lock poisoned")
            .register_command(namespace, name, command)
    }

    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.inner
            .transports
            .lock()
            .expect("transports lock poisoned")
            .push(transport);
    }

    /// Bind a lifecycle or connection hook.
    pub fn on(&self, kind: HookKind, hook: HookFn) {
        self.inner.hooks.register(kind, hook);
    }

    /// Seed an instance for a provider in the global container.
    pub async fn provide<T: Send + Sync + 'static>(&self, provider: &Provider<T>, value: T) {
        self.inner.container.provide(provider, value).await;
    }

    /// Mark a provider as an eager root for `container.load()`.
    pub fn eager<T>(&self, provider: &Provider<T>) {
        self.inner
            .eager
            .lock()
            .expect("eager lock poisoned")
            .push(provider.erased().clone());
    }

    /// Run a named task, locally or offloaded.
    pub async fn execute(&self, task: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.tasks.execute(task, args).await
    }

    /// Publish an event to a channel's subscribers.
    pub fn publish(&self, channel: &str, payload: &Value) -> usize {
        self.subscriptions().publish(channel, payload)
    }

    /// Run a registered command.
    pub async fn command(&self, namespace: &str, name: &str, args: Value) -> Result<Value> {
        let command = RegistryView::new(self.inner.registry.clone())
            .get_command(namespace, name)
            .ok_or_else(|| CoreError::NotFound {
                name: format!("{}:{}", namespace, name),
            })?;
        command(args).await
    }

    /// `BeforeInitialize` → essential commands → registry load → container
    /// load → `AfterInitialize`.
    pub async fn initialize(&self) -> Result<()> {
        self.transition(&[LifecycleState::Created], LifecycleState::Initializing, "initialize")?;
        info!(worker_id = self.inner.worker.id, kind = %self.inner.worker.kind, "initializing");

        self.inner
            .hooks
            .call(
                HookKind::BeforeInitialize,
                HookCallOptions::default(),
                HookContext::Lifecycle,
            )
            .await?;

        self.install_essential_commands()?;

        {
            let mut registry = self.inner.registry.write().expect("registry lock poisoned");
            registry.load()?;
            for (kind, hook) in registry.take_hooks() {
                self.inner.hooks.register(kind, hook);
            }
        }

        let eager = self
            .inner
            .eager
            .lock()
            .expect("eager lock poisoned")
            .clone();
        self.inner.container.load(&eager).await?;

        self.inner
            .hooks
            .call(
                HookKind::AfterInitialize,
                HookCallOptions::default(),
                HookContext::Lifecycle,
            )
            .await?;

        self.set_state(LifecycleState::Initialized);
        Ok(())
    }

    /// Initialize if needed, then start transports (api workers) and enter
    /// `Running`.
    pub async fn start(&self) -> Result<()> {
        if self.state() == LifecycleState::Created {
            self.initialize().await?;
        }
        self.transition(&[LifecycleState::Initialized], LifecycleState::Starting, "start")?;

        self.inner
            .hooks
            .call(
                HookKind::BeforeStart,
                HookCallOptions::default(),
                HookContext::Lifecycle,
            )
            .await?;

        if self.inner.worker.kind == WorkerKind::Api {
            let transports = self
                .inner
                .transports
                .lock()
                .expect("transports lock poisoned")
                .clone();
            let total = transports.len();
            let mut started = 0usize;
            let host: Arc<dyn ExtensionHost> = Arc::new(self.clone());
            for transport in transports {
                match transport.start(host.clone()).await {
                    Ok(()) => {
                        info!(transport = transport.name(), "transport started");
                        started += 1;
                    }
                    Err(err) => {
                        error!(transport = transport.name(), %err, "transport failed to start");
                    }
                }
            }
            if total > 0 && started == 0 {
                return Err(CoreError::internal("every transport failed to start"));
            }
        }

        self.inner
            .hooks
            .call(
                HookKind::AfterStart,
                HookCallOptions::default(),
                HookContext::Lifecycle,
            )
            .await?;

        self.set_state(LifecycleState::Running);
        info!("running");
        Ok(())
    }

    /// `BeforeStop` → stop transports → `AfterStop` → terminate. Calling
    /// `stop` on an application that is already stopping or stopped is a
    /// no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let state = self.state();
            match state {
                LifecycleState::Running | LifecycleState::Starting => {}
                LifecycleState::Stopping
                | LifecycleState::Terminating
                | LifecycleState::Terminated => return Ok(()),
                _ => {
                    let err = CoreError::InvalidState {
                        operation: "stop",
                        state: state.to_string(),
                    };
                    error!(%err, "stop rejected");
                    return Err(err);
                }
            }
        }
        self.set_state(LifecycleState::Stopping);
        info!("stopping");

        let _ = self
            .inner
            .hooks
            .call(
                HookKind::BeforeStop,
                HookCallOptions::default(),
                HookContext::Lifecycle,
            )
            .await;

        let transports = self
            .inner
            .transports
            .lock()
            .expect("transports lock poisoned")
            .clone();
        for transport in transports {
            if let Err(err) = transport.stop().await {
                warn!(transport = transport.name(), %err, "transport failed to stop");
            }
        }

        // Transports should have closed their connections; sweep leftovers.
        let leftover: Vec<ConnectionId> = self
            .inner
            .connections
            .lock()
            .expect("connections lock poisoned")
            .keys()
            .copied()
            .collect();
        for id in leftover {
            self.remove_connection(id).await;
        }

        let _ = self
            .inner
            .hooks
            .call(
                HookKind::AfterStop,
                HookCallOptions::default(),
                HookContext::Lifecycle,
            )
            .await;

        self.terminate().await
    }

    /// Reverse teardown hooks, container disposal, registry clear.
    /// Idempotent.
    pub async fn terminate(&self) -> Result<()> {
        {
            let state = self.state();
            match state {
                LifecycleState::Stopping | LifecycleState::Initialized => {}
                LifecycleState::Terminated | LifecycleState::Terminating => return Ok(()),
                _ => {
                    let err = CoreError::InvalidState {
                        operation: "terminate",
                        state: state.to_string(),
                    };
                    error!(%err, "terminate rejected");
                    return Err(err);
                }
            }
        }
        self.set_state(LifecycleState::Terminating);

        let _ = self
            .inner
            .hooks
            .call(
                HookKind::BeforeTerminate,
                HookCallOptions {
                    reverse: true,
                    ..Default::default()
                },
                HookContext::Lifecycle,
            )
            .await;

        self.inner.container.dispose().await;
        self.inner
            .registry
            .write()
            .expect("registry lock poisoned")
            .clear();

        let _ = self
            .inner
            .hooks
            .call(
                HookKind::AfterTerminate,
                HookCallOptions {
                    reverse: true,
                    ..Default::default()
                },
                HookContext::Lifecycle,
            )
            .await;

        self.set_state(LifecycleState::Terminated);
        info!("terminated");
        Ok(())
    }

    fn install_essential_commands(&self) -> Result<()> {
        let tasks = self.inner.tasks.clone();
        let execute: CommandFn = Arc::new(move |args: Value| {
            let tasks = tasks.clone();
            async move {
                let name = args
                    .get("task")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CoreError::InvalidPayload {
                        reason: "missing 'task' argument".to_string(),
                    })?
                    .to_string();
                let task_args = match args.get("args") {
                    Some(Value::Array(items)) => items.clone(),
                    Some(other) => vec![other.clone()],
                    None => Vec::new(),
                };
                tasks.execute(&name, task_args).await
            }
            .boxed()
        });

        let registry = self.inner.registry.clone();
        let print: CommandFn = Arc::new(move |_args: Value| {
            let registry = registry.clone();
            async move {
                registry.read().expect("registry lock poisoned").print();
                Ok(Value::Null)
            }
            .boxed()
        });

        let mut reg = self.inner.registry.write().expect("registry lock poisoned");
        reg.register_command("task", "execute", execute)?;
        reg.register_command("registry", "print", print)?;
        Ok(())
    }

    fn transition(
        &self,
        from: &[LifecycleState],
        to: LifecycleState,
        operation: &'static str,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().expect("state lock poisoned");
        if !from.contains(&*state) {
            let err = CoreError::InvalidState {
                operation,
                state: state.to_string(),
            };
            error!(%err, "lifecycle transition rejected");
            return Err(err);
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: LifecycleState) {
        *self.inner.state.lock().expect("state lock poisoned") = to;
    }

    async fn handle_rpc(&self, connection: ConnectionHandle, payload: Bytes) {
        let dispatcher = self.inner.dispatcher.clone();
        tokio::spawn(async move {
            let reply = dispatcher.dispatch(&connection, &payload, None).await;
            if connection
                .sender()
                .send(ClientFrame::new(ClientFrameKind::Rpc, reply))
                .await
                .is_err()
            {
                debug!(connection = %connection.id(), "connection gone before reply");
            }
        });
    }

    async fn handle_stream_open(&self, connection: &ConnectionHandle, payload: Bytes) {
        #[derive(serde::Deserialize)]
        struct OpenRequest {
            id: u32,
            #[serde(default)]
            meta: crate::streams::StreamMeta,
        }

        let open: OpenRequest = match self
            .inner
            .format
            .decode(&payload, connection.content_type())
            .and_then(|value| {
                serde_json::from_value(value).map_err(|e| CoreError::InvalidPayload {
                    reason: e.to_string(),
                })
            }) {
            Ok(open) => open,
            Err(err) => {
                warn!(%err, "malformed stream open frame");
                return;
            }
        };

        match connection.streams().accept_upstream(open.id, open.meta) {
            Ok(window) => {
                let ack = serde_json::json!({ "id": open.id, "window": window });
                if let Ok(bytes) = self.inner.format.encode(&ack, connection.content_type()) {
                    let _ = connection
                        .sender()
                        .send(ClientFrame::new(ClientFrameKind::StreamOpen, bytes))
                        .await;
                }
            }
            Err(err) => {
                warn!(stream = open.id, %err, "rejected upstream open");
                self.send_stream_abort(connection, open.id).await;
            }
        }
    }

    async fn send_stream_abort(&self, connection: &ConnectionHandle, id: u32) {
        let _ = connection
            .sender()
            .send(ClientFrame::new(
                ClientFrameKind::StreamAbort,
                Bytes::copy_from_slice(&id.to_be_bytes()),
            ))
            .await;
    }
}

fn split_stream_frame(mut payload: Bytes) -> Result<(u32, Bytes)> {
    if payload.len() < 4 {
        return Err(CoreError::InvalidPayload {
            reason: "stream frame shorter than id header".to_string(),
        });
    }
    let id = payload.get_u32();
    Ok((id, payload))
}

#[async_trait]
impl ExtensionHost for Application {
    fn format(&self) -> Arc<FormatSelector> {
        self.inner.format.clone()
    }

    fn registry(&self) -> RegistryView {
        RegistryView::new(self.inner.registry.clone())
    }

    async fn add_connection(
        &self,
        content_type: &str,
        sender: mpsc::Sender<ClientFrame>,
    ) -> Result<ConnectionHandle> {
        let container = self.inner.container.create_scope(Scope::Connection).await?;
        let streams = StreamTable::new(
            self.inner.config.stream_window,
            self.inner.aborted_streams.clone(),
        );
        let connection = Arc::new(Connection::new(
            content_type.to_string(),
            sender,
            container,
            streams,
        ));

        self.inner
            .connections
            .lock()
            .expect("connections lock poisoned")
            .insert(connection.id(), connection.clone());

        debug!(connection = %connection.id(), content_type, "connection added");
        let _ = self
            .inner
            .hooks
            .call(
                HookKind::OnConnection,
                HookCallOptions::default(),
                HookContext::Connection(connection.clone()),
            )
            .await;

        Ok(connection)
    }

    async fn remove_connection(&self, id: ConnectionId) {
        let connection = self
            .inner
            .connections
            .lock()
            .expect("connections lock poisoned")
            .remove(&id);
        let Some(connection) = connection else {
            return;
        };

        // Subscriptions go first so no publish can observe the dead
        // connection, then streams abort, then hooks and scope disposal.
        self.subscriptions().remove_connection(id);
        connection.streams().abort_all();
        connection.cancellation().cancel();

        let _ = self
            .inner
            .hooks
            .call(
                HookKind::OnDisconnection,
                HookCallOptions::default(),
                HookContext::Connection(connection.clone()),
            )
            .await;

        connection.container().dispose().await;
        debug!(connection = %id, "connection removed");
    }

    fn get_connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner
            .connections
            .lock()
            .expect("connections lock poisoned")
            .get(&id)
            .cloned()
    }

    async fn handle_frame(&self, connection: &ConnectionHandle, frame: ClientFrame) -> Result<()> {
        match frame.kind {
            ClientFrameKind::Rpc => {
                self.handle_rpc(connection.clone(), frame.payload).await;
            }
            ClientFrameKind::StreamOpen => {
                self.handle_stream_open(connection, frame.payload).await;
            }
            ClientFrameKind::StreamData => {
                let (id, chunk) = split_stream_frame(frame.payload)?;
                if let Err(err) = connection.streams().data(id, chunk) {
                    debug!(stream = id, %err, "stream data rejected");
                    self.send_stream_abort(connection, id).await;
                }
            }
            ClientFrameKind::StreamEnd => {
                let (id, _) = split_stream_frame(frame.payload)?;
                if let Err(err) = connection.streams().end(id) {
                    debug!(stream = id, %err, "stream end rejected");
                }
            }
            ClientFrameKind::StreamAbort => {
                let (id, _) = split_stream_frame(frame.payload)?;
                let _ = connection.streams().abort(id);
            }
            ClientFrameKind::SubscriptionEvent => {
                warn!(connection = %connection.id(), "client sent a server-only frame kind");
            }
            ClientFrameKind::Error => {
                warn!(connection = %connection.id(), "client reported a connection error");
            }
        }
        Ok(())
    }
}
