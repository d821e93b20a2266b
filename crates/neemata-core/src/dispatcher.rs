// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Procedure call dispatch.
//!
//! One dispatch resolves the procedure, decodes and validates the input,
//! opens a call scope, runs guards and middlewares around the handler under
//! a deadline, validates and encodes the output, and disposes the call
//! scope on every exit path.
//!
//! Timeouts cancel through the call's token; a handler that ignores the
//! token keeps running detached, but its response is discarded.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::context::CallContext;
use crate::error::{CoreError, Result};
use crate::format::FormatSelector;
use crate::registry::{NextFn, Procedure, RegistryView};
use crate::scope::Scope;
use crate::transport::ConnectionHandle;

/// Envelope of one RPC request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCall {
    /// Client-chosen correlation id, echoed in the reply.
    pub id: u64,
    pub procedure: String,
    #[serde(default)]
    pub payload: Value,
}

/// Envelope of one RPC reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<neemata_protocol::WireError>,
}

/// Resolves and executes procedure calls.
pub struct ApiDispatcher {
    registry: RegistryView,
    format: Arc<FormatSelector>,
    timeout: Duration,
}

impl ApiDispatcher {
    pub fn new(registry: RegistryView, format: Arc<FormatSelector>, timeout: Duration) -> Self {
        Self {
            registry,
            format,
            timeout,
        }
    }

    /// Dispatch a raw RPC frame payload and encode the reply.
    ///
    /// Always produces reply bytes; failures travel as wire errors.
    pub async fn dispatch(
        &self,
        connection: &ConnectionHandle,
        payload: &[u8],
        timeout_override: Option<Duration>,
    ) -> Bytes {
        let content_type = connection.content_type().to_string();

        let reply = match self.decode_call(payload, &content_type) {
            Ok(call) => {
                let id = call.id;
                match self
                    .call(connection, &call.procedure, call.payload, timeout_override)
                    .await
                {
                    Ok(result) => RpcReply {
                        id,
                        result: Some(result),
                        error: None,
                    },
                    Err(err) => {
                        self.log_failure(&call.procedure, &err);
                        RpcReply {
                            id,
                            result: None,
                            error: Some(err.to_wire()),
                        }
                    }
                }
            }
            Err(err) => RpcReply {
                id: 0,
                result: None,
                error: Some(err.to_wire()),
            },
        };

        match serde_json::to_value(&reply)
            .map_err(|e| CoreError::internal(e.to_string()))
            .and_then(|value| self.format.encode(&value, &content_type))
        {
            Ok(bytes) => bytes,
            Err(err) => {
                // Reply encoding failed; fall back to a plain JSON error so
                // the client always hears back.
                error!(%err, "failed to encode rpc reply");
                let fallback = RpcReply {
                    id: reply.id,
                    result: None,
                    error: Some(CoreError::internal("reply encoding failed").to_wire()),
                };
                Bytes::from(serde_json::to_vec(&fallback).unwrap_or_default())
            }
        }
    }

    /// Execute a procedure with an already-decoded input value.
    pub async fn call(
        &self,
        connection: &ConnectionHandle,
        procedure_name: &str,
        input: Value,
        timeout_override: Option<Duration>,
    ) -> Result<Value> {
        let procedure =
            self.registry
                .get_procedure(procedure_name)
                .ok_or_else(|| CoreError::NotFound {
                    name: procedure_name.to_string(),
                })?;

        procedure
            .input()
            .validate(&input)
            .map_err(|issues| CoreError::Validation { issues })?;

        let scope = connection.container().create_scope(Scope::Call).await?;
        let token = connection.cancellation().child_token();
        let ctx = Arc::new(CallContext::new(
            connection.clone(),
            procedure_name.to_string(),
            token.clone(),
            scope.clone(),
        ));

        let result = self
            .invoke(&procedure, ctx, input, timeout_override, &token)
            .await;

        scope.dispose().await;
        result
    }

    async fn invoke(
        &self,
        procedure: &Arc<Procedure>,
        ctx: Arc<CallContext>,
        input: Value,
        timeout_override: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<Value> {
        for guard in procedure.guards() {
            if !guard(ctx.clone()).await? {
                return Err(CoreError::Forbidden { reason: None });
            }
        }

        // Innermost continuation is the handler; middlewares wrap it
        // outermost-first.
        let handler = procedure.handler().clone();
        let handler_ctx = ctx.clone();
        let mut next: NextFn = Box::new(move |value| handler(handler_ctx, value));
        for middleware in procedure.middlewares().iter().rev() {
            let middleware = middleware.clone();
            let middleware_ctx = ctx.clone();
            let inner = next;
            next = Box::new(move |value| middleware(middleware_ctx, value, inner));
        }

        let deadline = procedure
            .timeout()
            .into_iter()
            .chain(timeout_override)
            .chain(std::iter::once(self.timeout))
            .min()
            .expect("deadline list is never empty");

        let mut handle = tokio::spawn(next(input));
        let output = tokio::select! {
            joined = &mut handle => {
                joined.map_err(|e| CoreError::internal(format!("handler panicked: {}", e)))??
            }
            _ = tokio::time::sleep(deadline) => {
                // Cooperative cancellation; the handler may keep running but
                // its response is discarded.
                token.cancel();
                return Err(CoreError::Timeout);
            }
        };

        procedure
            .output()
            .validate(&output)
            .map_err(|issues| CoreError::Validation { issues })?;
        Ok(output)
    }

    fn decode_call(&self, payload: &[u8], content_type: &str) -> Result<RpcCall> {
        let value = self.format.decode(payload, content_type)?;
        serde_json::from_value(value).map_err(|e| CoreError::InvalidPayload {
            reason: format!("malformed rpc envelope: {}", e),
        })
    }

    fn log_failure(&self, procedure: &str, err: &CoreError) {
        match err {
            CoreError::Internal { message } => {
                error!(procedure, %message, "procedure failed with internal error");
            }
            err if !err.is_surfaced() => {
                error!(procedure, %err, "procedure failed with non-surfaced error");
            }
            err => {
                warn!(procedure, code = err.error_code(), "procedure call failed");
            }
        }
    }
}
