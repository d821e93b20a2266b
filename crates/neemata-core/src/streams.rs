// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-connection binary stream registry.
//!
//! Streams are identified by a 32-bit id, monotonically increasing per
//! connection per direction; ids are never reused. Upstreams are opened by
//! clients, downstreams by the server. Data flow is credit-based: each DATA
//! chunk consumes one credit, the consumer grants credits back as it reads.
//! Any stream not `closed` when the connection dies is aborted and its
//! readers observe a terminal error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{CoreError, Result};

/// Stream metadata supplied on open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// State of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Pending,
    Open,
    Closed,
    Errored,
}

enum StreamEvent {
    Data(Bytes),
    End,
    Abort,
}

struct UpStream {
    state: StreamState,
    credits: u32,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

struct DownStream {
    state: StreamState,
}

struct TableState {
    up: HashMap<u32, UpStream>,
    /// Readers not yet claimed by a handler.
    unclaimed: HashMap<u32, UpstreamReader>,
    down: HashMap<u32, DownStream>,
    last_up_id: u32,
    next_down_id: u32,
    closed: bool,
}

/// Stream bookkeeping for one connection.
pub struct StreamTable {
    window: u32,
    aborted: Arc<AtomicU64>,
    state: Mutex<TableState>,
}

impl StreamTable {
    /// `window` is the initial flow-control credit per upstream; `aborted`
    /// is the shared aborted-streams counter.
    pub fn new(window: u32, aborted: Arc<AtomicU64>) -> Self {
        Self {
            window,
            aborted,
            state: Mutex::new(TableState {
                up: HashMap::new(),
                unclaimed: HashMap::new(),
                down: HashMap::new(),
                last_up_id: 0,
                next_down_id: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().expect("stream table lock poisoned")
    }

    /// Accept a client-opened upstream. The id must be strictly greater than
    /// any previously seen upstream id on this connection.
    pub fn accept_upstream(&self, id: u32, meta: StreamMeta) -> Result<u32> {
        let mut state = self.lock();
        if state.closed {
            return Err(CoreError::StreamAborted { stream_id: id });
        }
        if id <= state.last_up_id {
            return Err(CoreError::InvalidPayload {
                reason: format!("upstream id {} reused or out of order", id),
            });
        }
        state.last_up_id = id;

        let (tx, rx) = mpsc::unbounded_channel();
        state.up.insert(
            id,
            UpStream {
                state: StreamState::Open,
                credits: self.window,
                tx,
            },
        );
        state.unclaimed.insert(
            id,
            UpstreamReader {
                id,
                meta,
                rx,
                done: false,
            },
        );
        Ok(self.window)
    }

    /// Claim the reader for an accepted upstream. Each reader can be taken
    /// exactly once.
    pub fn take_upstream(&self, id: u32) -> Option<UpstreamReader> {
        self.lock().unclaimed.remove(&id)
    }

    /// Deliver a DATA chunk. Consumes one credit; a chunk that arrives with
    /// the window exhausted aborts the stream.
    pub fn data(&self, id: u32, chunk: Bytes) -> Result<()> {
        let mut state = self.lock();
        let Some(entry) = state.up.get_mut(&id) else {
            return Err(CoreError::StreamAborted { stream_id: id });
        };
        if entry.state != StreamState::Open {
            return Err(CoreError::StreamAborted { stream_id: id });
        }
        if entry.credits == 0 {
            entry.state = StreamState::Errored;
            let _ = entry.tx.send(StreamEvent::Abort);
            self.aborted.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::StreamAborted { stream_id: id });
        }
        entry.credits -= 1;
        let _ = entry.tx.send(StreamEvent::Data(chunk));
        Ok(())
    }

    /// Grant `n` credits back to an upstream, returning the new window.
    pub fn grant(&self, id: u32, n: u32) -> Result<u32> {
        let mut state = self.lock();
        let Some(entry) = state.up.get_mut(&id) else {
            return Err(CoreError::StreamAborted { stream_id: id });
        };
        entry.credits = entry.credits.saturating_add(n);
        Ok(entry.credits)
    }

    /// Mark normal end of an upstream.
    pub fn end(&self, id: u32) -> Result<()> {
        let mut state = self.lock();
        let Some(entry) = state.up.get_mut(&id) else {
            return Err(CoreError::StreamAborted { stream_id: id });
        };
        if entry.state != StreamState::Open {
            return Err(CoreError::StreamAborted { stream_id: id });
        }
        entry.state = StreamState::Closed;
        let _ = entry.tx.send(StreamEvent::End);
        Ok(())
    }

    /// Abort an upstream; pending reads observe the failure.
    pub fn abort(&self, id: u32) -> Result<()> {
        let mut state = self.lock();
        let Some(entry) = state.up.get_mut(&id) else {
            return Err(CoreError::StreamAborted { stream_id: id });
        };
        if entry.state == StreamState::Open || entry.state == StreamState::Pending {
            entry.state = StreamState::Errored;
            let _ = entry.tx.send(StreamEvent::Abort);
            self.aborted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Allocate a server-opened downstream id.
    pub fn open_downstream(&self) -> Result<u32> {
        let mut state = self.lock();
        if state.closed {
            return Err(CoreError::internal("connection is closed"));
        }
        let id = state.next_down_id;
        state.next_down_id += 1;
        state.down.insert(
            id,
            DownStream {
                state: StreamState::Open,
            },
        );
        Ok(id)
    }

    /// Mark a downstream closed after its final chunk was sent.
    pub fn close_downstream(&self, id: u32) -> Result<()> {
        let mut state = self.lock();
        let Some(entry) = state.down.get_mut(&id) else {
            return Err(CoreError::StreamAborted { stream_id: id });
        };
        entry.state = StreamState::Closed;
        Ok(())
    }

    /// Current state of a stream, upstream direction first.
    pub fn state_of(&self, id: u32) -> Option<StreamState> {
        let state = self.lock();
        state
            .up
            .get(&id)
            .map(|s| s.state)
            .or_else(|| state.down.get(&id).map(|s| s.state))
    }

    /// Abort every stream that is not closed. Called on connection death;
    /// afterwards the table rejects all further operations.
    pub fn abort_all(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        for entry in state.up.values_mut() {
            if entry.state == StreamState::Open || entry.state == StreamState::Pending {
                entry.state = StreamState::Errored;
                let _ = entry.tx.send(StreamEvent::Abort);
                self.aborted.fetch_add(1, Ordering::Relaxed);
            }
        }
        for entry in state.down.values_mut() {
            if entry.state == StreamState::Open || entry.state == StreamState::Pending {
                entry.state = StreamState::Errored;
                self.aborted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Consumer handle for an upstream's data.
pub struct UpstreamReader {
    id: u32,
    meta: StreamMeta,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    done: bool,
}

impl UpstreamReader {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn meta(&self) -> &StreamMeta {
        &self.meta
    }

    /// Read the next chunk. `Ok(None)` signals normal end of stream; an
    /// aborted stream yields `StreamAborted`.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(StreamEvent::Data(chunk)) => Ok(Some(chunk)),
            Some(StreamEvent::End) => {
                self.done = true;
                Ok(None)
            }
            Some(StreamEvent::Abort) | None => {
                self.done = true;
                Err(CoreError::StreamAborted { stream_id: self.id })
            }
        }
    }
}
