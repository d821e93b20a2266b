// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the application lifecycle.

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde_json::json;

use neemata_core::{
    Application, Config, CoreError, HookFn, HookKind, LifecycleState, Module, Task, TaskFn,
    WorkerData, WorkerKind,
};

fn api_worker() -> WorkerData {
    WorkerData {
        id: 0,
        kind: WorkerKind::Api,
        has_task_runners: false,
    }
}

fn recording(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> HookFn {
    Arc::new(move |_ctx| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(name);
            Ok(())
        }
        .boxed()
    })
}

#[tokio::test]
async fn ordered_shutdown_runs_teardown_hooks_in_reverse() {
    let app = Application::new(Config::default(), api_worker());
    let log = Arc::new(Mutex::new(Vec::new()));

    for name in ["stop-1", "stop-2", "stop-3"] {
        app.on(HookKind::BeforeStop, recording(name, log.clone()));
    }
    app.on(HookKind::AfterStop, recording("after-stop", log.clone()));
    for name in ["terminate-1", "terminate-2"] {
        app.on(HookKind::BeforeTerminate, recording(name, log.clone()));
    }
    for name in ["after-terminate-1", "after-terminate-2"] {
        app.on(HookKind::AfterTerminate, recording(name, log.clone()));
    }

    app.start().await.unwrap();
    assert_eq!(app.state(), LifecycleState::Running);

    app.stop().await.unwrap();
    assert_eq!(app.state(), LifecycleState::Terminated);

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            // Stop hooks in registration order.
            "stop-1",
            "stop-2",
            "stop-3",
            "after-stop",
            // Teardown hooks reversed.
            "terminate-2",
            "terminate-1",
            "after-terminate-2",
            "after-terminate-1",
        ]
    );
}

#[tokio::test]
async fn stop_twice_is_a_noop() {
    let app = Application::new(Config::default(), api_worker());
    let count = Arc::new(Mutex::new(Vec::new()));
    app.on(HookKind::BeforeStop, recording("stop", count.clone()));

    app.start().await.unwrap();
    app.stop().await.unwrap();
    app.stop().await.unwrap();

    assert_eq!(count.lock().unwrap().len(), 1);
    assert_eq!(app.state(), LifecycleState::Terminated);
}

#[tokio::test]
async fn terminate_twice_is_a_noop() {
    let app = Application::new(Config::default(), api_worker());
    app.initialize().await.unwrap();

    app.terminate().await.unwrap();
    app.terminate().await.unwrap();
    assert_eq!(app.state(), LifecycleState::Terminated);
}

#[tokio::test]
async fn start_after_stop_is_rejected() {
    let app = Application::new(Config::default(), api_worker());
    app.start().await.unwrap();
    app.stop().await.unwrap();

    let err = app.start().await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
}

#[tokio::test]
async fn initialize_twice_is_rejected() {
    let app = Application::new(Config::default(), api_worker());
    app.initialize().await.unwrap();

    let err = app.initialize().await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
}

#[tokio::test]
async fn failing_start_hook_aborts_startup() {
    let app = Application::new(Config::default(), api_worker());
    let failing: HookFn =
        Arc::new(|_ctx| async { Err(CoreError::internal("extension broke")) }.boxed());
    app.on(HookKind::BeforeStart, failing);

    assert!(app.start().await.is_err());
    assert_ne!(app.state(), LifecycleState::Running);
}

#[tokio::test]
async fn essential_commands_installed_at_initialize() {
    let app = Application::new(Config::default(), api_worker());

    let add: TaskFn = Arc::new(|_ctx, args| {
        async move {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }
        .boxed()
    });
    app.register_module(Module::new("math").task(Task::new("add", add)))
        .unwrap();
    app.initialize().await.unwrap();

    // The task command runs a registered task by name.
    let result = app
        .command(
            "task",
            "execute",
            json!({"task": "math/add", "args": [2, 3]}),
        )
        .await
        .unwrap();
    assert_eq!(result, json!(5));

    // The registry print command exists and succeeds.
    app.command("registry", "print", json!(null)).await.unwrap();
}

#[tokio::test]
async fn subscription_manager_fixed_after_initialize() {
    let app = Application::new(Config::default(), api_worker());
    app.initialize().await.unwrap();

    let replacement = Arc::new(neemata_core::BasicSubscriptions::new(Arc::new(
        neemata_core::FormatSelector::default(),
    )));
    let err = app.with_subscriptions(replacement).unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
}

#[tokio::test]
async fn module_registration_rejected_after_initialize() {
    let app = Application::new(Config::default(), api_worker());
    app.initialize().await.unwrap();

    let err = app.register_module(Module::new("late")).unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
}

#[tokio::test]
async fn local_task_executes_and_cleans_up() {
    let app = Application::new(
        Config::default(),
        WorkerData {
            id: 0,
            kind: WorkerKind::Task,
            has_task_runners: false,
        },
    );

    let add: TaskFn = Arc::new(|_ctx, args| {
        async move {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }
        .boxed()
    });
    app.register_module(Module::new("math").task(Task::new("add", add)))
        .unwrap();
    app.start().await.unwrap();

    let result = app.execute("math/add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(result, json!(5));

    app.stop().await.unwrap();
}
