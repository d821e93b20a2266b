// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker process slots.
//!
//! A slot owns one spawned worker process and its framed stdio channel.
//! Inbound messages and process exits are reported to the supervisor's
//! event loop; outbound messages go through a per-slot writer pump.

use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use neemata_core::WorkerKind;
use neemata_protocol::{FrameError, FramedChannel, WorkerMessage};

/// Errors from spawning and driving worker processes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker stdio was not piped")]
    MissingStdio,

    #[error("worker {0} failed before becoming ready")]
    StartupFailed(SlotKey),

    #[error("supervisor event channel closed")]
    EventChannelClosed,
}

/// Identity of a worker slot: its kind and numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub kind: WorkerKind,
    pub id: u32,
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.kind, self.id)
    }
}

/// Supervisor-side view of a worker's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Stopping,
    Crashed,
}

/// How to launch a worker process.
///
/// The default re-executes the current binary in worker mode; the
/// `NEEMATA_ENTRY` environment variable points it at a different
/// entrypoint binary.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn from_env() -> Result<Self, SupervisorError> {
        let program = match std::env::var("NEEMATA_ENTRY") {
            Ok(entry) => PathBuf::from(entry),
            Err(_) => std::env::current_exe()?,
        };
        Ok(Self {
            program,
            args: Vec::new(),
        })
    }
}

/// Events flowing into the supervisor loop.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// A message arrived from a worker.
    Message(SlotKey, WorkerMessage),
    /// A worker process exited with the given code (`None` = signal).
    Exited(SlotKey, Option<i32>),
}

/// One supervised worker process.
pub struct WorkerSlot {
    pub key: SlotKey,
    pub state: WorkerState,
    pid: Option<u32>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerSlot {
    /// Spawn a worker process and wire its stdio into the event channel.
    pub fn spawn(
        command: &WorkerCommand,
        key: SlotKey,
        has_task_runners: bool,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Result<Self, SupervisorError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .env("NEEMATA_WORKER", "1")
            .env("NEEMATA_WORKER_ID", key.id.to_string())
            .env("NEEMATA_WORKER_KIND", key.kind.to_string())
            .env("NEEMATA_TASK_RUNNERS", if has_task_runners { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(SupervisorError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(SupervisorError::MissingStdio)?;
        let pid = child.id();
        debug!(worker = %key, pid, "worker spawned");

        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        tokio::spawn(async move {
            let mut stdin = FramedChannel::new(stdin);
            while let Some(message) = outbox_rx.recv().await {
                let frame = match message.to_frame() {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(%err, "failed to encode worker message");
                        continue;
                    }
                };
                if stdin.write_frame(&frame).await.is_err() {
                    break;
                }
            }
        });

        {
            let events = events.clone();
            tokio::spawn(async move {
                let mut stdout = FramedChannel::new(stdout);
                loop {
                    match stdout.read_frame().await {
                        Ok(frame) => match WorkerMessage::from_frame(&frame) {
                            Ok(message) => {
                                if events.send(SupervisorEvent::Message(key, message)).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(worker = %key, %err, "undecodable worker message");
                            }
                        },
                        Err(FrameError::ChannelClosed) => break,
                        Err(err) => {
                            warn!(worker = %key, %err, "worker channel failed");
                            break;
                        }
                    }
                }
            });
        }

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(worker = %key, %err, "failed to reap worker");
                    None
                }
            };
            let _ = events.send(SupervisorEvent::Exited(key, code));
        });

        Ok(Self {
            key,
            state: WorkerState::Starting,
            pid,
            outbox,
        })
    }

    /// OS pid of the process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue a message for the worker.
    pub fn send(&self, message: WorkerMessage) {
        let _ = self.outbox.send(message);
    }

    /// Forcibly terminate the process. The exit waiter reports the death
    /// like any other.
    pub fn kill(&self) {
        if let Some(pid) = self.pid {
            debug!(worker = %self.key, pid, "killing worker");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }
}
