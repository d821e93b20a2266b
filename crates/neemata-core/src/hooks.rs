// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle and connection hook engine.
//!
//! Hooks run sequentially in registration order (optionally reversed for
//! teardown kinds) or concurrently. Failure policy: initialize/start kinds
//! abort on the first failure; every other kind logs and continues.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::{BoxFuture, join_all};
use tracing::{error, warn};

use crate::error::{CoreError, Result};
use crate::transport::ConnectionHandle;

/// The closed set of hook kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeInitialize,
    AfterInitialize,
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
    BeforeTerminate,
    AfterTerminate,
    OnConnection,
    OnDisconnection,
}

impl HookKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::BeforeInitialize => "before-initialize",
            Self::AfterInitialize => "after-initialize",
            Self::BeforeStart => "before-start",
            Self::AfterStart => "after-start",
            Self::BeforeStop => "before-stop",
            Self::AfterStop => "after-stop",
            Self::BeforeTerminate => "before-terminate",
            Self::AfterTerminate => "after-terminate",
            Self::OnConnection => "on-connection",
            Self::OnDisconnection => "on-disconnection",
        }
    }

    /// Kinds whose failures abort the sequence and propagate.
    pub fn is_start_sensitive(self) -> bool {
        matches!(
            self,
            Self::BeforeInitialize | Self::AfterInitialize | Self::BeforeStart | Self::AfterStart
        )
    }
}

/// What a hook invocation is about.
#[derive(Clone)]
pub enum HookContext {
    /// A plain lifecycle transition.
    Lifecycle,
    /// A connection arriving or departing.
    Connection(ConnectionHandle),
}

/// A registered hook callback.
pub type HookFn =
    Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Options for one hook invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookCallOptions {
    /// Run all bindings concurrently instead of sequentially.
    pub concurrent: bool,
    /// Invoke in reverse registration order (teardown kinds).
    pub reverse: bool,
}

/// Ordered or concurrent invocation of registered hooks.
#[derive(Default)]
pub struct HookEngine {
    bindings: RwLock<HashMap<HookKind, Vec<HookFn>>>,
}

impl HookEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook; invocation order is registration order.
    pub fn register(&self, kind: HookKind, hook: HookFn) {
        self.bindings
            .write()
            .expect("hook registry lock poisoned")
            .entry(kind)
            .or_default()
            .push(hook);
    }

    /// Number of bindings for a kind.
    pub fn count(&self, kind: HookKind) -> usize {
        self.bindings
            .read()
            .expect("hook registry lock poisoned")
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invoke all bindings of a kind.
    pub async fn call(
        &self,
        kind: HookKind,
        options: HookCallOptions,
        ctx: HookContext,
    ) -> Result<()> {
        let mut hooks = {
            let bindings = self.bindings.read().expect("hook registry lock poisoned");
            bindings.get(&kind).cloned().unwrap_or_default()
        };
        if options.reverse {
            hooks.reverse();
        }

        if options.concurrent {
            self.call_concurrent(kind, hooks, ctx).await
        } else {
            self.call_sequential(kind, hooks, ctx).await
        }
    }

    async fn call_sequential(
        &self,
        kind: HookKind,
        hooks: Vec<HookFn>,
        ctx: HookContext,
    ) -> Result<()> {
        for hook in hooks {
            match hook(ctx.clone()).await {
                Ok(()) => {}
                Err(err) if kind.is_start_sensitive() => {
                    error!(hook = kind.name(), %err, "hook failed; aborting");
                    return Err(err);
                }
                Err(err) => {
                    warn!(hook = kind.name(), %err, "hook failed; continuing");
                }
            }
        }
        Ok(())
    }

    async fn call_concurrent(
        &self,
        kind: HookKind,
        hooks: Vec<HookFn>,
        ctx: HookContext,
    ) -> Result<()> {
        let outcomes = join_all(hooks.into_iter().map(|hook| hook(ctx.clone()))).await;

        let failures: Vec<CoreError> = outcomes.into_iter().filter_map(|r| r.err()).collect();
        if failures.is_empty() {
            return Ok(());
        }

        for err in &failures {
            warn!(hook = kind.name(), %err, "hook failed");
        }

        if kind.is_start_sensitive() {
            let combined = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CoreError::internal(format!(
                "{} hook(s) failed: {}",
                failures.len(),
                combined
            )));
        }
        Ok(())
    }
}
