// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime configuration shared by the supervisor and its workers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of api worker processes.
    pub api_workers: u32,
    /// Number of task worker processes.
    pub task_workers: u32,
    /// Default procedure deadline.
    pub api_timeout: Duration,
    /// Default task deadline (local and offloaded).
    pub tasks_timeout: Duration,
    /// Grace window for workers to exit on shutdown.
    pub shutdown_timeout: Duration,
    /// Initial flow-control credit per upstream.
    pub stream_window: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_workers: 1,
            task_workers: 0,
            api_timeout: Duration::from_millis(15_000),
            tasks_timeout: Duration::from_millis(60_000),
            shutdown_timeout: Duration::from_millis(10_000),
            stream_window: 16,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `NEEMATA_API_WORKERS`: api worker count (default: 1)
    /// - `NEEMATA_TASK_WORKERS`: task worker count (default: 0)
    /// - `NEEMATA_API_TIMEOUT_MS`: procedure deadline in ms (default: 15000)
    /// - `NEEMATA_TASKS_TIMEOUT_MS`: task deadline in ms (default: 60000)
    /// - `NEEMATA_SHUTDOWN_TIMEOUT_MS`: shutdown grace in ms (default: 10000)
    /// - `NEEMATA_STREAM_WINDOW`: per-stream credit window (default: 16)
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();

        Ok(Self {
            api_workers: env_parse("NEEMATA_API_WORKERS", default.api_workers)?,
            task_workers: env_parse("NEEMATA_TASK_WORKERS", default.task_workers)?,
            api_timeout: Duration::from_millis(env_parse(
                "NEEMATA_API_TIMEOUT_MS",
                default.api_timeout.as_millis() as u64,
            )?),
            tasks_timeout: Duration::from_millis(env_parse(
                "NEEMATA_TASKS_TIMEOUT_MS",
                default.tasks_timeout.as_millis() as u64,
            )?),
            shutdown_timeout: Duration::from_millis(env_parse(
                "NEEMATA_SHUTDOWN_TIMEOUT_MS",
                default.shutdown_timeout.as_millis() as u64,
            )?),
            stream_window: env_parse("NEEMATA_STREAM_WINDOW", default.stream_window)?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

/// The role of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Terminates transports and executes procedures.
    Api,
    /// Executes offloaded tasks.
    Task,
}

impl std::str::FromStr for WorkerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(WorkerKind::Api),
            "task" => Ok(WorkerKind::Task),
            _ => Err(ConfigError::Invalid(
                "NEEMATA_WORKER_KIND",
                "must be 'api' or 'task'",
            )),
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Api => f.write_str("api"),
            WorkerKind::Task => f.write_str("task"),
        }
    }
}

/// Identity handed to a worker process at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerData {
    /// Numeric id within the worker's kind.
    pub id: u32,
    pub kind: WorkerKind,
    /// Whether task workers exist that api workers may offload to.
    pub has_task_runners: bool,
}

impl WorkerData {
    /// Load worker identity from the environment set by the supervisor.
    ///
    /// Required:
    /// - `NEEMATA_WORKER_ID`: numeric worker id
    /// - `NEEMATA_WORKER_KIND`: `api` or `task`
    ///
    /// Optional:
    /// - `NEEMATA_TASK_RUNNERS`: `1` when task workers are available
    pub fn from_env() -> Result<Self, ConfigError> {
        let id = std::env::var("NEEMATA_WORKER_ID")
            .map_err(|_| ConfigError::Missing("NEEMATA_WORKER_ID"))?
            .parse()
            .map_err(|_| ConfigError::Invalid("NEEMATA_WORKER_ID", "must be an integer"))?;

        let kind: WorkerKind = std::env::var("NEEMATA_WORKER_KIND")
            .map_err(|_| ConfigError::Missing("NEEMATA_WORKER_KIND"))?
            .parse()?;

        let has_task_runners = std::env::var("NEEMATA_TASK_RUNNERS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            id,
            kind,
            has_task_runners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_workers, 1);
        assert_eq!(config.task_workers, 0);
        assert_eq!(config.api_timeout, Duration::from_secs(15));
        assert_eq!(config.tasks_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.stream_window, 16);
    }

    #[test]
    fn test_worker_kind_parse() {
        assert_eq!("api".parse::<WorkerKind>().unwrap(), WorkerKind::Api);
        assert_eq!("task".parse::<WorkerKind>().unwrap(), WorkerKind::Task);
        assert!("supervisor".parse::<WorkerKind>().is_err());
    }

    #[test]
    fn test_worker_kind_display_round_trip() {
        for kind in [WorkerKind::Api, WorkerKind::Task] {
            assert_eq!(kind.to_string().parse::<WorkerKind>().unwrap(), kind);
        }
    }
}
