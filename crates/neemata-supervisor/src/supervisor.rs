// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The supervisor: spawns the worker pool, runs the readiness handshake,
//! routes task offloads, replaces crashed workers and coordinates graceful
//! shutdown.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use neemata_core::{Config, WorkerKind};
use neemata_protocol::{ExecuteAbort, ExecuteResult, WireError, WorkerMessage};

use crate::router::Router;
use crate::worker::{SlotKey, SupervisorError, SupervisorEvent, WorkerCommand, WorkerSlot, WorkerState};

const DEADLINE_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Parent process orchestrating api and task workers.
pub struct Supervisor {
    config: Config,
    command: WorkerCommand,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    events: mpsc::UnboundedReceiver<SupervisorEvent>,
    slots: HashMap<SlotKey, WorkerSlot>,
    router: Router,
    sweep: tokio::time::Interval,
    exiting: bool,
    crashed_during_shutdown: bool,
}

impl Supervisor {
    pub fn new(config: Config, command: WorkerCommand) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut sweep = tokio::time::interval(DEADLINE_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            config,
            command,
            events_tx,
            events,
            slots: HashMap::new(),
            router: Router::new(),
            sweep,
            exiting: false,
            crashed_during_shutdown: false,
        }
    }

    /// Current worker states, for introspection.
    pub fn workers(&self) -> Vec<(SlotKey, WorkerState)> {
        self.slots
            .values()
            .map(|slot| (slot.key, slot.state))
            .collect()
    }

    /// OS pid of a worker, if it is running.
    pub fn worker_pid(&self, key: SlotKey) -> Option<u32> {
        self.slots.get(&key).and_then(WorkerSlot::pid)
    }

    /// Spawn every worker, await each one's `Ready`, then post `Start`.
    ///
    /// A worker that errors before `Ready` is fatal: all started workers are
    /// told to stop and the error propagates.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        let has_task_runners = self.config.task_workers > 0;

        for id in 0..self.config.api_workers {
            self.spawn_slot(
                SlotKey {
                    kind: WorkerKind::Api,
                    id,
                },
                has_task_runners,
            )?;
        }
        for id in 0..self.config.task_workers {
            self.spawn_slot(
                SlotKey {
                    kind: WorkerKind::Task,
                    id,
                },
                has_task_runners,
            )?;
        }

        let mut pending: usize = self.slots.len();
        while pending > 0 {
            match self.events.recv().await {
                Some(SupervisorEvent::Message(key, WorkerMessage::Ready)) => {
                    self.mark_ready(key);
                    pending -= 1;
                }
                Some(SupervisorEvent::Exited(key, code)) => {
                    error!(worker = %key, ?code, "worker died before becoming ready");
                    for slot in self.slots.values() {
                        slot.send(WorkerMessage::Stop);
                    }
                    return Err(SupervisorError::StartupFailed(key));
                }
                Some(SupervisorEvent::Message(key, message)) => {
                    warn!(worker = %key, kind = ?message.kind(), "unexpected message during startup");
                }
                None => {
                    return Err(SupervisorError::EventChannelClosed);
                }
            }
        }

        for slot in self.slots.values() {
            slot.send(WorkerMessage::Start);
        }
        info!(
            api_workers = self.config.api_workers,
            task_workers = self.config.task_workers,
            "all workers ready"
        );
        Ok(())
    }

    /// Serve events until the event channel closes.
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        while self.tick().await? {}
        Ok(())
    }

    /// Process one event (or deadline sweep). Returns `false` once the
    /// event stream has ended.
    pub async fn tick(&mut self) -> Result<bool, SupervisorError> {
        tokio::select! {
            event = self.events.recv() => match event {
                Some(event) => {
                    self.handle_event(event)?;
                    Ok(true)
                }
                None => Ok(false),
            },
            _ = self.sweep.tick() => {
                self.sweep_deadlines();
                Ok(true)
            }
        }
    }

    /// Graceful stop: post `Stop` to every worker and await their exits
    /// within the shutdown timeout; stragglers are killed. Returns `true`
    /// if every worker exited cleanly.
    pub async fn shutdown(&mut self) -> bool {
        self.exiting = true;
        info!("stopping workers");
        for slot in self.slots.values_mut() {
            slot.state = WorkerState::Stopping;
            slot.send(WorkerMessage::Stop);
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !self.slots.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) => {
                    let _ = self.handle_event(event);
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if !self.slots.is_empty() {
            for slot in self.slots.values() {
                warn!(worker = %slot.key, "worker did not stop in time; killing");
                slot.kill();
            }
            // Collect the forced exits so nothing is left unreaped.
            let grace = Instant::now() + Duration::from_secs(2);
            while !self.slots.is_empty() {
                let remaining = grace.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, self.events.recv()).await {
                    Ok(Some(event)) => {
                        let _ = self.handle_event(event);
                    }
                    _ => break,
                }
            }
        }

        info!("supervisor stopped");
        !self.crashed_during_shutdown
    }

    fn spawn_slot(&mut self, key: SlotKey, has_task_runners: bool) -> Result<(), SupervisorError> {
        let slot = WorkerSlot::spawn(&self.command, key, has_task_runners, self.events_tx.clone())?;
        self.slots.insert(key, slot);
        Ok(())
    }

    fn mark_ready(&mut self, key: SlotKey) {
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.state = WorkerState::Ready;
        }
        if key.kind == WorkerKind::Task {
            self.router.add_runner(key);
        }
        debug!(worker = %key, "worker ready");
    }

    fn handle_event(&mut self, event: SupervisorEvent) -> Result<(), SupervisorError> {
        match event {
            SupervisorEvent::Message(from, message) => self.handle_message(from, message),
            SupervisorEvent::Exited(key, code) => self.handle_exit(key, code),
        }
        Ok(())
    }

    fn handle_message(&mut self, from: SlotKey, message: WorkerMessage) {
        match message {
            WorkerMessage::Ready => {
                // A replacement worker finished initializing.
                self.mark_ready(from);
                if let Some(slot) = self.slots.get(&from) {
                    slot.send(WorkerMessage::Start);
                }
            }
            WorkerMessage::ExecuteInvoke(invoke) => {
                let deadline = Instant::now() + self.config.tasks_timeout;
                match self.router.assign(invoke.correlation_id, from, deadline) {
                    Some(target) => {
                        debug!(
                            task = %invoke.task_name,
                            correlation_id = %invoke.correlation_id,
                            worker = %target,
                            "routing task"
                        );
                        if let Some(slot) = self.slots.get(&target) {
                            slot.send(WorkerMessage::ExecuteInvoke(invoke));
                        }
                    }
                    None => {
                        warn!(task = %invoke.task_name, "no task runner available");
                        if let Some(slot) = self.slots.get(&from) {
                            slot.send(WorkerMessage::ExecuteResult(ExecuteResult::err(
                                invoke.correlation_id,
                                WireError::new("TASK_WORKER_LOST", "no task runner available"),
                            )));
                        }
                    }
                }
            }
            WorkerMessage::ExecuteResult(result) => {
                match self.router.complete(result.correlation_id) {
                    Some(route) => {
                        if let Some(slot) = self.slots.get(&route.origin) {
                            slot.send(WorkerMessage::ExecuteResult(result));
                        }
                    }
                    None => {
                        // Deadline already fired for this correlation.
                        debug!(correlation_id = %result.correlation_id, "dropping late reply");
                    }
                }
            }
            other => {
                warn!(worker = %from, kind = ?other.kind(), "unexpected message from worker");
            }
        }
    }

    fn handle_exit(&mut self, key: SlotKey, code: Option<i32>) {
        self.slots.remove(&key);

        if self.exiting {
            if code != Some(0) {
                warn!(worker = %key, ?code, "worker crashed during shutdown");
                self.crashed_during_shutdown = true;
            } else {
                debug!(worker = %key, "worker exited");
            }
            return;
        }

        error!(worker = %key, ?code, "worker exited unexpectedly; replacing");

        // Fail the calls the dead worker was serving and abort the ones it
        // was awaiting.
        let (targeting, originating) = self.router.worker_lost(key);
        for (correlation_id, route) in targeting {
            if let Some(slot) = self.slots.get(&route.origin) {
                slot.send(WorkerMessage::ExecuteResult(ExecuteResult::err(
                    correlation_id,
                    WireError::new("TASK_WORKER_LOST", "task worker crashed mid-call"),
                )));
            }
        }
        for (correlation_id, route) in originating {
            if let Some(slot) = self.slots.get(&route.target) {
                slot.send(WorkerMessage::ExecuteAbort(ExecuteAbort { correlation_id }));
            }
        }

        let has_task_runners = self.config.task_workers > 0;
        if let Err(err) = self.spawn_slot(key, has_task_runners) {
            error!(worker = %key, %err, "failed to respawn worker");
        }
    }

    fn sweep_deadlines(&mut self) {
        for (correlation_id, route) in self.router.expired(Instant::now()) {
            warn!(
                correlation_id = %correlation_id,
                worker = %route.target,
                "offloaded task deadline expired"
            );
            if let Some(slot) = self.slots.get(&route.origin) {
                slot.send(WorkerMessage::ExecuteResult(ExecuteResult::err(
                    correlation_id,
                    WireError::new("TASK_TIMEOUT", "task deadline exceeded"),
                )));
            }
            if let Some(slot) = self.slots.get(&route.target) {
                slot.send(WorkerMessage::ExecuteAbort(ExecuteAbort { correlation_id }));
            }
        }
    }
}
