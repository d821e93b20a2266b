// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker process loop.
//!
//! A worker owns one [`Application`] and a framed channel to the
//! supervisor. It initializes, reports `Ready`, then serves channel
//! messages until `Stop` or channel loss.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use neemata_protocol::{FrameError, FramedChannel, WorkerMessage};

use crate::application::{Application, LifecycleState};
use crate::error::CoreError;

/// Run the worker loop over the supervisor channel.
///
/// The sequence mirrors the supervisor handshake: initialize, send `Ready`,
/// then `Start` begins serving and `Stop` (or a closed channel) winds the
/// application down.
pub async fn run_worker<R, W>(app: Application, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    app.tasks().connect(outbox.clone());

    let writer_pump = tokio::spawn(async move {
        let mut writer = FramedChannel::new(writer);
        while let Some(message) = outbox_rx.recv().await {
            let frame = message.to_frame()?;
            writer.write_frame(&frame).await?;
        }
        Ok::<(), FrameError>(())
    });

    app.initialize().await?;
    let _ = outbox.send(WorkerMessage::Ready);
    debug!(worker_id = app.worker().id, "worker ready");

    let mut reader = FramedChannel::new(reader);
    loop {
        let frame = match reader.read_frame().await {
            Ok(frame) => frame,
            Err(FrameError::ChannelClosed) => {
                warn!("supervisor channel closed; stopping");
                break;
            }
            Err(err) => {
                error!(%err, "supervisor channel failed; stopping");
                break;
            }
        };

        match WorkerMessage::from_frame(&frame)? {
            WorkerMessage::Start => app.start().await?,
            WorkerMessage::Stop => {
                debug!("stop requested by supervisor");
                break;
            }
            WorkerMessage::ExecuteInvoke(invoke) => {
                let tasks = app.tasks().clone();
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    let result = tasks.serve_invoke(invoke).await;
                    let _ = outbox.send(WorkerMessage::ExecuteResult(result));
                });
            }
            WorkerMessage::ExecuteResult(result) => app.tasks().handle_result(result),
            WorkerMessage::ExecuteAbort(abort) => app.tasks().abort(abort.correlation_id),
            WorkerMessage::Ready => {
                warn!("unexpected Ready from supervisor; ignoring");
            }
        }
    }

    app.tasks().fail_all(CoreError::TaskWorkerLost);
    let shutdown = match app.state() {
        LifecycleState::Running | LifecycleState::Starting => app.stop().await,
        _ => app.terminate().await,
    };
    if let Err(err) = shutdown {
        error!(%err, "shutdown failed");
    }
    writer_pump.abort();
    Ok(())
}

/// Run the worker loop over this process's stdio, the channel the
/// supervisor wires up at spawn time.
pub async fn run_worker_stdio(app: Application) -> Result<()> {
    run_worker(app, tokio::io::stdin(), tokio::io::stdout()).await
}
