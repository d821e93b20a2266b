// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task execution engine.
//!
//! Tasks run locally (task workers, local-only tasks, or api workers
//! without task runners) or are offloaded through the supervisor to a task
//! worker. Offloaded calls are matched to replies by correlation id; a task
//! worker crash fails every correlation routed to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use neemata_protocol::{ExecuteInvoke, ExecuteResult, WorkerMessage};

use crate::config::{WorkerData, WorkerKind};
use crate::container::Container;
use crate::context::TaskContext;
use crate::error::{CoreError, Result};
use crate::registry::{RegistryView, Task};
use crate::scope::Scope;

/// Executes tasks locally or offloads them to task workers.
pub struct TaskEngine {
    worker: WorkerData,
    registry: RegistryView,
    global: Container,
    timeout: Duration,
    outbox: Mutex<Option<mpsc::UnboundedSender<WorkerMessage>>>,
    inflight: Mutex<HashMap<Uuid, oneshot::Sender<Result<Value>>>>,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl TaskEngine {
    pub fn new(
        worker: WorkerData,
        registry: RegistryView,
        global: Container,
        timeout: Duration,
    ) -> Self {
        Self {
            worker,
            registry,
            global,
            timeout,
            outbox: Mutex::new(None),
            inflight: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the supervisor channel; offloading requires it.
    pub fn connect(&self, outbox: mpsc::UnboundedSender<WorkerMessage>) {
        *self.outbox.lock().expect("task engine lock poisoned") = Some(outbox);
    }

    /// Execute a task by its full registered name.
    pub async fn execute(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let task = self
            .registry
            .get_task(name)
            .ok_or_else(|| CoreError::NotFound {
                name: name.to_string(),
            })?;

        let outbox = self
            .outbox
            .lock()
            .expect("task engine lock poisoned")
            .clone();

        let offload = self.worker.kind == WorkerKind::Api
            && self.worker.has_task_runners
            && !task.is_local_only()
            && outbox.is_some();

        if offload {
            self.execute_remote(name, args, outbox.expect("checked above"))
                .await
        } else {
            self.execute_local(name, &task, args, None).await
        }
    }

    /// Run an offload request received from the supervisor; called on task
    /// workers.
    pub async fn serve_invoke(&self, invoke: ExecuteInvoke) -> ExecuteResult {
        let Some(task) = self.registry.get_task(&invoke.task_name) else {
            return ExecuteResult::err(
                invoke.correlation_id,
                CoreError::NotFound {
                    name: invoke.task_name.clone(),
                }
                .to_wire(),
            );
        };

        match self
            .execute_local(
                &invoke.task_name,
                &task,
                invoke.args,
                Some(invoke.correlation_id),
            )
            .await
        {
            Ok(output) => ExecuteResult::ok(invoke.correlation_id, output),
            Err(err) => ExecuteResult::err(invoke.correlation_id, err.to_wire()),
        }
    }

    /// Complete an offloaded call with the reply routed back by the
    /// supervisor.
    pub fn handle_result(&self, result: ExecuteResult) {
        let completion = self
            .inflight
            .lock()
            .expect("task engine lock poisoned")
            .remove(&result.correlation_id);

        let Some(completion) = completion else {
            debug!(
                correlation_id = %result.correlation_id,
                "dropping reply for unknown correlation"
            );
            return;
        };

        let outcome = match (result.output, result.error) {
            (Some(output), None) => Ok(output),
            (_, Some(error)) => Err(CoreError::from_wire(&error)),
            (None, None) => Err(CoreError::internal("execute reply carried no outcome")),
        };
        let _ = completion.send(outcome);
    }

    /// Best-effort cancellation of an in-flight local execution.
    pub fn abort(&self, correlation_id: Uuid) {
        if let Some(token) = self
            .running
            .lock()
            .expect("task engine lock poisoned")
            .get(&correlation_id)
        {
            token.cancel();
        }
    }

    /// Fail every in-flight offloaded call; used when the supervisor
    /// channel or a task worker is lost.
    pub fn fail_all(&self, error: CoreError) {
        let completions: Vec<oneshot::Sender<Result<Value>>> = {
            let mut inflight = self.inflight.lock().expect("task engine lock poisoned");
            inflight.drain().map(|(_, tx)| tx).collect()
        };
        for completion in completions {
            let _ = completion.send(Err(error.clone()));
        }
    }

    /// In-flight offloaded call count.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().expect("task engine lock poisoned").len()
    }

    async fn execute_local(
        &self,
        full_name: &str,
        task: &Arc<Task>,
        args: Vec<Value>,
        correlation_id: Option<Uuid>,
    ) -> Result<Value> {
        let scope = self.global.create_scope(Scope::Call).await?;
        let token = CancellationToken::new();
        if let Some(id) = correlation_id {
            self.running
                .lock()
                .expect("task engine lock poisoned")
                .insert(id, token.clone());
        }

        let ctx = TaskContext::new(full_name.to_string(), token.clone(), scope.clone());
        let deadline = task.timeout().unwrap_or(self.timeout);
        let handler = task.handler().clone();

        let mut handle = tokio::spawn(handler(ctx, args));
        let result = tokio::select! {
            joined = &mut handle => {
                joined.map_err(|e| CoreError::internal(format!("task panicked: {}", e)))
                    .and_then(|r| r)
            }
            _ = tokio::time::sleep(deadline) => {
                token.cancel();
                Err(CoreError::TaskTimeout)
            }
            _ = token.cancelled() => {
                // Aborted from the supervisor; the body may finish on its
                // own time, the outcome is discarded.
                Err(CoreError::TaskTimeout)
            }
        };

        if let Some(id) = correlation_id {
            self.running
                .lock()
                .expect("task engine lock poisoned")
                .remove(&id);
        }
        scope.dispose().await;
        result
    }

    async fn execute_remote(
        &self,
        name: &str,
        args: Vec<Value>,
        outbox: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Result<Value> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inflight
            .lock()
            .expect("task engine lock poisoned")
            .insert(correlation_id, tx);

        let message = WorkerMessage::ExecuteInvoke(ExecuteInvoke {
            correlation_id,
            task_name: name.to_string(),
            args,
        });
        if outbox.send(message).is_err() {
            self.inflight
                .lock()
                .expect("task engine lock poisoned")
                .remove(&correlation_id);
            warn!(task = name, "supervisor channel closed; cannot offload");
            return Err(CoreError::TaskWorkerLost);
        }

        // The supervisor enforces the deadline; the local guard is slightly
        // wider so the supervisor's verdict normally wins.
        let guard = self.timeout + Duration::from_secs(1);
        match tokio::time::timeout(guard, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CoreError::TaskWorkerLost),
            Err(_) => {
                self.inflight
                    .lock()
                    .expect("task engine lock poisoned")
                    .remove(&correlation_id);
                Err(CoreError::TaskTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Module, Registry, TaskFn};
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::RwLock;

    fn add_task() -> TaskFn {
        Arc::new(|_ctx, args| {
            async move {
                let a = args[0].as_i64().unwrap_or(0);
                let b = args[1].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            }
            .boxed()
        })
    }

    fn engine_with(module: Module, worker: WorkerData, timeout: Duration) -> TaskEngine {
        let mut registry = Registry::new();
        registry.register_module(module).unwrap();
        registry.load().unwrap();
        TaskEngine::new(
            worker,
            RegistryView::new(Arc::new(RwLock::new(registry))),
            Container::new(Scope::Global),
            timeout,
        )
    }

    fn task_worker() -> WorkerData {
        WorkerData {
            id: 0,
            kind: WorkerKind::Task,
            has_task_runners: false,
        }
    }

    fn api_worker_with_runners() -> WorkerData {
        WorkerData {
            id: 0,
            kind: WorkerKind::Api,
            has_task_runners: true,
        }
    }

    #[tokio::test]
    async fn test_local_execution() {
        let module = Module::new("math").task(Task::new("add", add_task()));
        let engine = engine_with(module, task_worker(), Duration::from_secs(1));

        let result = engine
            .execute("math/add", vec![json!(2), json!(3)])
            .await
            .unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let engine = engine_with(Module::new("math"), task_worker(), Duration::from_secs(1));
        let err = engine.execute("math/missing", vec![]).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_deadline() {
        let forever: TaskFn = Arc::new(|ctx, _args| {
            async move {
                ctx.cancellation().cancelled().await;
                Ok(Value::Null)
            }
            .boxed()
        });
        let module = Module::new("jobs").task(Task::new("sleep", forever));
        let engine = engine_with(module, task_worker(), Duration::from_millis(50));

        let err = engine.execute("jobs/sleep", vec![]).await.unwrap_err();
        assert!(matches!(err, CoreError::TaskTimeout));
    }

    #[tokio::test]
    async fn test_api_worker_without_runners_executes_locally() {
        let module = Module::new("math").task(Task::new("add", add_task()));
        let worker = WorkerData {
            id: 0,
            kind: WorkerKind::Api,
            has_task_runners: false,
        };
        let engine = engine_with(module, worker, Duration::from_secs(1));

        let result = engine
            .execute("math/add", vec![json!(1), json!(1)])
            .await
            .unwrap();
        assert_eq!(result, json!(2));
    }

    #[tokio::test]
    async fn test_local_only_task_never_offloads() {
        let module = Module::new("math").task(Task::local("add", add_task()));
        let engine = engine_with(module, api_worker_with_runners(), Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.connect(tx);

        let result = engine
            .execute("math/add", vec![json!(4), json!(4)])
            .await
            .unwrap();
        assert_eq!(result, json!(8));
        assert!(rx.try_recv().is_err(), "no offload message expected");
    }

    #[tokio::test]
    async fn test_offload_round_trip() {
        let module = Module::new("math").task(Task::new("add", add_task()));
        let engine = Arc::new(engine_with(
            module,
            api_worker_with_runners(),
            Duration::from_secs(1),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.connect(tx);

        // Play the supervisor/task-worker side.
        let responder = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let message = rx.recv().await.unwrap();
                let WorkerMessage::ExecuteInvoke(invoke) = message else {
                    panic!("expected ExecuteInvoke");
                };
                assert_eq!(invoke.task_name, "math/add");
                engine.handle_result(ExecuteResult::ok(invoke.correlation_id, json!(5)));
            })
        };

        let result = engine
            .execute("math/add", vec![json!(2), json!(3)])
            .await
            .unwrap();
        assert_eq!(result, json!(5));
        assert_eq!(engine.inflight_count(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_all_surfaces_worker_loss() {
        let module = Module::new("math").task(Task::new("add", add_task()));
        let engine = Arc::new(engine_with(
            module,
            api_worker_with_runners(),
            Duration::from_secs(5),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.connect(tx);

        let killer = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = rx.recv().await.unwrap();
                engine.fail_all(CoreError::TaskWorkerLost);
            })
        };

        let err = engine
            .execute("math/add", vec![json!(1), json!(2)])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TaskWorkerLost));
        killer.await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_invoke_and_abort() {
        let cooperative: TaskFn = Arc::new(|ctx, _args| {
            async move {
                ctx.cancellation().cancelled().await;
                Ok(json!("cancelled"))
            }
            .boxed()
        });
        let module = Module::new("jobs").task(Task::new("wait", cooperative));
        let engine = Arc::new(engine_with(module, task_worker(), Duration::from_secs(30)));

        let correlation_id = Uuid::new_v4();
        let serving = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .serve_invoke(ExecuteInvoke {
                        correlation_id,
                        task_name: "jobs/wait".to_string(),
                        args: vec![],
                    })
                    .await
            })
        };

        // Let the execution register, then abort it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.abort(correlation_id);

        let result = serving.await.unwrap();
        assert_eq!(result.correlation_id, correlation_id);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_serve_invoke_unknown_task() {
        let engine = engine_with(Module::new("jobs"), task_worker(), Duration::from_secs(1));
        let result = engine
            .serve_invoke(ExecuteInvoke {
                correlation_id: Uuid::new_v4(),
                task_name: "jobs/none".to_string(),
                args: vec![],
            })
            .await;
        assert_eq!(result.error.unwrap().code, "NOT_FOUND");
    }
}
