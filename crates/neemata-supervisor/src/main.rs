// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Neemata entrypoint binary.
//!
//! Runs as the supervisor by default; the supervisor re-executes this
//! binary with `NEEMATA_WORKER` set to host each worker process. User
//! entrypoints are pointed at via `NEEMATA_ENTRY` by the CLI.
//!
//! Exit codes: 0 normal, 1 startup failure, 2 worker crash during
//! shutdown, 130 on signal.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Value, json};
use tracing::{error, info};

use neemata_core::{
    Application, Config, CoreError, Module, Task, TaskFn, WorkerData, run_worker_stdio,
};
use neemata_supervisor::{Supervisor, WorkerCommand};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("neemata=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = if std::env::var("NEEMATA_WORKER").is_ok() {
        worker_main().await
    } else {
        supervisor_main().await
    };
    std::process::exit(code);
}

async fn worker_main() -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration error");
            return 1;
        }
    };
    let worker = match WorkerData::from_env() {
        Ok(worker) => worker,
        Err(err) => {
            error!(%err, "worker data error");
            return 1;
        }
    };

    info!(worker_id = worker.id, kind = %worker.kind, "worker starting");

    let app = Application::new(config, worker);
    if let Err(err) = app.register_module(diagnostics_module()) {
        error!(%err, "failed to register diagnostics module");
        return 1;
    }

    match run_worker_stdio(app).await {
        Ok(()) => 0,
        Err(err) => {
            error!(%err, "worker failed");
            1
        }
    }
}

/// Smoke-test tasks every worker carries: `neemata/echo` returns its first
/// argument, `neemata/sleep` waits the requested milliseconds while
/// observing cancellation.
fn diagnostics_module() -> Module {
    let echo: TaskFn = Arc::new(|_ctx, mut args| {
        async move {
            if args.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(args.remove(0))
            }
        }
        .boxed()
    });

    let sleep: TaskFn = Arc::new(|ctx, args| {
        async move {
            let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!(ms)),
                _ = ctx.cancellation().cancelled() => Err(CoreError::TaskTimeout),
            }
        }
        .boxed()
    });

    Module::new("neemata")
        .task(Task::new("echo", echo))
        .task(Task::new("sleep", sleep))
}

async fn supervisor_main() -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration error");
            return 1;
        }
    };
    let command = match WorkerCommand::from_env() {
        Ok(command) => command,
        Err(err) => {
            error!(%err, "cannot resolve worker entrypoint");
            return 1;
        }
    };

    info!(
        api_workers = config.api_workers,
        task_workers = config.task_workers,
        "starting supervisor"
    );

    let mut supervisor = Supervisor::new(config, command);
    if let Err(err) = supervisor.start().await {
        error!(%err, "startup failed");
        supervisor.shutdown().await;
        return 1;
    }

    let interrupted = tokio::select! {
        result = supervisor.run() => {
            if let Err(err) = result {
                error!(%err, "supervisor loop failed");
            }
            false
        }
        _ = tokio::signal::ctrl_c() => {
            info!("signal received; shutting down");
            true
        }
    };

    let clean = supervisor.shutdown().await;
    if !clean {
        2
    } else if interrupted {
        130
    } else {
        0
    }
}
