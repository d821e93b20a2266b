// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests spawning real worker processes from the `neemata` binary.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use neemata_core::{Config, WorkerKind};
use neemata_protocol::{ExecuteInvoke, WorkerMessage};
use neemata_supervisor::{
    SlotKey, Supervisor, SupervisorEvent, WorkerCommand, WorkerSlot, WorkerState,
};

fn worker_command() -> WorkerCommand {
    WorkerCommand {
        program: PathBuf::from(env!("CARGO_BIN_EXE_neemata")),
        args: Vec::new(),
    }
}

fn test_config(api: u32, task: u32) -> Config {
    let mut config = Config::default();
    config.api_workers = api;
    config.task_workers = task;
    config.shutdown_timeout = Duration::from_secs(10);
    config
}

async fn recv_event(
    events: &mut mpsc::UnboundedReceiver<SupervisorEvent>,
) -> SupervisorEvent {
    tokio::time::timeout(Duration::from_secs(20), events.recv())
        .await
        .expect("timed out waiting for worker event")
        .expect("event channel closed")
}

#[tokio::test]
async fn task_worker_slot_round_trip() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let key = SlotKey {
        kind: WorkerKind::Task,
        id: 0,
    };

    let slot = WorkerSlot::spawn(&worker_command(), key, false, events_tx)
        .expect("failed to spawn worker");

    match recv_event(&mut events).await {
        SupervisorEvent::Message(from, WorkerMessage::Ready) => assert_eq!(from, key),
        other => panic!("expected Ready, got {:?}", other),
    }

    slot.send(WorkerMessage::Start);

    let correlation_id = Uuid::new_v4();
    slot.send(WorkerMessage::ExecuteInvoke(ExecuteInvoke {
        correlation_id,
        task_name: "neemata/echo".to_string(),
        args: vec![json!("hello from the supervisor")],
    }));

    match recv_event(&mut events).await {
        SupervisorEvent::Message(_, WorkerMessage::ExecuteResult(result)) => {
            assert_eq!(result.correlation_id, correlation_id);
            assert_eq!(result.output, Some(json!("hello from the supervisor")));
            assert!(result.error.is_none());
        }
        other => panic!("expected ExecuteResult, got {:?}", other),
    }

    slot.send(WorkerMessage::Stop);
    match recv_event(&mut events).await {
        SupervisorEvent::Exited(from, code) => {
            assert_eq!(from, key);
            assert_eq!(code, Some(0));
        }
        other => panic!("expected clean exit, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_task_reports_not_found() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let key = SlotKey {
        kind: WorkerKind::Task,
        id: 0,
    };
    let slot = WorkerSlot::spawn(&worker_command(), key, false, events_tx).unwrap();

    match recv_event(&mut events).await {
        SupervisorEvent::Message(_, WorkerMessage::Ready) => {}
        other => panic!("expected Ready, got {:?}", other),
    }
    slot.send(WorkerMessage::Start);

    slot.send(WorkerMessage::ExecuteInvoke(ExecuteInvoke {
        correlation_id: Uuid::new_v4(),
        task_name: "neemata/does-not-exist".to_string(),
        args: vec![],
    }));

    match recv_event(&mut events).await {
        SupervisorEvent::Message(_, WorkerMessage::ExecuteResult(result)) => {
            assert_eq!(result.error.unwrap().code, "NOT_FOUND");
        }
        other => panic!("expected ExecuteResult, got {:?}", other),
    }

    slot.send(WorkerMessage::Stop);
    loop {
        if let SupervisorEvent::Exited(_, _) = recv_event(&mut events).await {
            break;
        }
    }
}

#[tokio::test]
async fn supervisor_starts_pool_and_stops_cleanly() {
    let mut supervisor = Supervisor::new(test_config(1, 2), worker_command());
    supervisor.start().await.expect("startup failed");

    let workers = supervisor.workers();
    assert_eq!(workers.len(), 3);
    assert!(workers.iter().all(|(_, state)| *state == WorkerState::Ready));

    let clean = supervisor.shutdown().await;
    assert!(clean, "expected a clean shutdown");
    assert!(supervisor.workers().is_empty());
}

#[tokio::test]
async fn crashed_task_worker_is_replaced() {
    let mut supervisor = Supervisor::new(test_config(0, 1), worker_command());
    supervisor.start().await.expect("startup failed");

    let key = SlotKey {
        kind: WorkerKind::Task,
        id: 0,
    };
    let old_pid = supervisor.worker_pid(key).expect("worker should be running");

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(old_pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .expect("failed to kill worker");

    // Drive the event loop until the replacement is ready.
    let replaced = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            supervisor.tick().await.expect("supervisor loop failed");
            let ready = supervisor
                .workers()
                .iter()
                .any(|(k, state)| *k == key && *state == WorkerState::Ready);
            if ready && supervisor.worker_pid(key) != Some(old_pid) {
                break supervisor.worker_pid(key);
            }
        }
    })
    .await
    .expect("replacement worker never became ready");

    assert!(replaced.is_some());
    assert_ne!(replaced, Some(old_pid));

    let clean = supervisor.shutdown().await;
    assert!(clean);
}
