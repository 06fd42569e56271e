// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Engine
//!
//! Writes a stream of [`OutboundMessage`]s to the broker in arrival order. The next
//! message is pulled from the input only after the previous one was handed to the
//! channel, so the input's own pacing bounds what the engine holds.
//!
//! [`Publisher::send`] publishes on a channel shared by all plain sends of the
//! instance, serialized by a lock. [`Publisher::send_with_confirms`] runs each
//! operation on a dedicated confirm-mode channel, tracks every write in a
//! [`crate::ledger`] task and returns the confirmation results as a stream. Every
//! message handed to the channel yields exactly one result.

use crate::{
    client::AmqpChannel,
    connection::ConnectionManager,
    errors::AmqpError,
    ledger::{self, LedgerCommand, LedgerConfirms, LedgerShutdown, ResultReceiver},
    message::{OutboundMessage, OutboundMessageResult},
};
use futures_util::{
    future::join_all,
    pin_mut,
    stream::{Stream, StreamExt},
};
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

/// How long `close()` waits for operations to wind down once their pending
/// confirmations were failed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Options for a confirm-tracked send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    max_in_flight: Option<usize>,
}

impl SendOptions {
    pub fn new() -> Self {
        SendOptions::default()
    }

    /// Stop pulling input while `max` publishes are unconfirmed.
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max.max(1));
        self
    }
}

/// Stream of confirmation results of one `send_with_confirms` operation.
///
/// Yields one `Ok` per published message in the order the broker confirmed them.
/// When the operation fails, the unconfirmed messages are yielded as failed results,
/// followed by a single `Err` with the cause, after which the stream ends.
pub struct ConfirmStream {
    results: ResultReceiver,
    done: bool,
}

impl ConfirmStream {
    fn failed(cause: AmqpError) -> Self {
        let (tx, results) = mpsc::unbounded_channel();
        let _ = tx.send(Err(cause));
        ConfirmStream {
            results,
            done: false,
        }
    }
}

impl Stream for ConfirmStream {
    type Item = Result<OutboundMessageResult, AmqpError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.results.poll_recv(cx) {
            Poll::Ready(Some(Err(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

struct ConfirmOp {
    commands: mpsc::UnboundedSender<LedgerCommand>,
    task: JoinHandle<()>,
}

pub struct Publisher {
    connections: Arc<ConnectionManager>,
    shared: AsyncMutex<Option<Arc<dyn AmqpChannel>>>,
    ops: Mutex<Vec<ConfirmOp>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Publisher {
    /// Creates a publisher; channels are opened by the first send.
    ///
    /// # Parameters
    /// * `connections` - The connection shared with the owning sender
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Publisher {
            connections,
            shared: AsyncMutex::new(None),
            ops: Mutex::new(Vec::new()),
            shutdown: watch::Sender::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Publishes every message without waiting for broker confirmation.
    ///
    /// Completes once the input is exhausted. The first failed write ends the
    /// operation with a `PublishError`; messages written before it stay published.
    pub async fn send<S>(&self, messages: S) -> Result<(), AmqpError>
    where
        S: Stream<Item = OutboundMessage>,
    {
        pin_mut!(messages);

        while let Some(message) = messages.next().await {
            if self.closed.load(Ordering::SeqCst) {
                return Err(AmqpError::SenderClosed);
            }

            let mut shared = self.shared.lock().await;
            let channel = match shared.as_ref() {
                Some(channel) if channel.is_open() => channel.clone(),
                _ => {
                    let channel = self.connections.channel().await?;
                    debug!(channel = channel.id(), "publish channel opened");
                    *shared = Some(channel.clone());
                    channel
                }
            };

            channel.publish(&message).await.map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishError(err.to_string())
            })?;
        }

        Ok(())
    }

    /// Publishes every message on a dedicated confirm-mode channel and streams the
    /// broker's confirmations.
    ///
    /// The operation runs in its own task; dropping the returned stream stops it from
    /// pulling further input.
    pub fn send_with_confirms<S>(&self, messages: S, options: SendOptions) -> ConfirmStream
    where
        S: Stream<Item = OutboundMessage> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return ConfirmStream::failed(AmqpError::SenderClosed);
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (results_tx, results) = mpsc::unbounded_channel();

        let task = tokio::spawn(confirm_op(
            self.connections.clone(),
            messages,
            options,
            commands.clone(),
            commands_rx,
            results_tx,
            self.shutdown.subscribe(),
        ));

        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        ops.retain(|op| !op.task.is_finished());
        ops.push(ConfirmOp { commands, task });

        ConfirmStream {
            results,
            done: false,
        }
    }

    /// Stops accepting publishes and waits up to `timeout` for outstanding
    /// confirmations. Entries still pending after that are failed with a
    /// `ChannelClosedError`. Closes the shared publish channel.
    ///
    /// Returns within `timeout` plus [`TERMINATE_GRACE`]; operations still running
    /// after the grace period are aborted.
    pub async fn close(&self, timeout: Duration) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let ops = std::mem::take(&mut *self.ops.lock().unwrap_or_else(PoisonError::into_inner));
        let (commands, mut tasks): (Vec<_>, Vec<_>) =
            ops.into_iter().map(|op| (op.commands, op.task)).unzip();

        if tokio::time::timeout(timeout, join_all(tasks.iter_mut()))
            .await
            .is_err()
        {
            warn!(
                operations = tasks.iter().filter(|t| !t.is_finished()).count(),
                "confirmations still outstanding at close"
            );
            for tx in &commands {
                let _ = tx.send(LedgerCommand::Terminate(AmqpError::ChannelClosedError(
                    "sender closed before confirms arrived".to_owned(),
                )));
            }
            // completed handles must not be polled again
            tasks.retain(|task| !task.is_finished());
            if tokio::time::timeout(TERMINATE_GRACE, join_all(tasks.iter_mut()))
                .await
                .is_err()
            {
                warn!(operations = tasks.len(), "aborting operations after close grace period");
                tasks.iter().for_each(JoinHandle::abort);
            }
        }

        let shared = self.shared.lock().await.take();
        match shared {
            Some(channel) if channel.is_open() => channel.close().await,
            _ => Ok(()),
        }
    }
}

async fn confirm_op<S>(
    connections: Arc<ConnectionManager>,
    messages: S,
    options: SendOptions,
    commands: mpsc::UnboundedSender<LedgerCommand>,
    commands_rx: mpsc::UnboundedReceiver<LedgerCommand>,
    results: ledger::ResultSender,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Stream<Item = OutboundMessage> + Send,
{
    let channel = match connections.channel().await {
        Ok(channel) => channel,
        Err(err) => {
            let _ = results.send(Err(err));
            return;
        }
    };

    let ledger_task = ledger::spawn(channel.id(), commands_rx, results.clone());
    channel.on_shutdown(Arc::new(LedgerShutdown(commands.clone())));

    match channel
        .enable_confirms(Arc::new(LedgerConfirms(commands.clone())))
        .await
    {
        Ok(()) => {
            let permits = options
                .max_in_flight
                .map(|max| Arc::new(Semaphore::new(max)));
            let outcome = publish_loop(&channel, messages, &commands, permits, &mut shutdown).await;
            let _ = commands.send(match outcome {
                Ok(()) => LedgerCommand::InputComplete,
                Err(err) => LedgerCommand::Terminate(err),
            });
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            let _ = commands.send(LedgerCommand::Terminate(err));
        }
    }

    let _ = ledger_task.await;

    if channel.is_open() {
        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close confirm channel");
        }
    }

    // the result stream ends only after the channel is released
    drop(results);
}

async fn publish_loop<S>(
    channel: &Arc<dyn AmqpChannel>,
    messages: S,
    ledger: &mpsc::UnboundedSender<LedgerCommand>,
    permits: Option<Arc<Semaphore>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), AmqpError>
where
    S: Stream<Item = OutboundMessage> + Send,
{
    pin_mut!(messages);

    loop {
        let permit = match &permits {
            Some(permits) => tokio::select! {
                _ = ledger.closed() => return Ok(()),
                _ = stopped(shutdown) => return Ok(()),
                permit = permits.clone().acquire_owned() => {
                    Some(permit.map_err(|err| AmqpError::InternalError(err.to_string()))?)
                }
            },
            None => None,
        };

        let message = tokio::select! {
            _ = ledger.closed() => return Ok(()),
            _ = stopped(shutdown) => return Ok(()),
            message = messages.next() => match message {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        if !channel.is_open() {
            return Err(AmqpError::ChannelClosedError(format!(
                "channel {} closed before publish",
                channel.id()
            )));
        }

        let seq_no = channel.next_publish_seq_no();
        let tracked = ledger.send(LedgerCommand::Track {
            seq_no,
            message: message.clone(),
            permit,
        });
        if tracked.is_err() {
            return Ok(());
        }

        if let Err(err) = channel.publish(&message).await {
            error!(error = err.to_string(), seq_no, "error publishing message");
            let _ = ledger.send(LedgerCommand::Untrack { seq_no });
            return Err(if channel.is_open() {
                AmqpError::PublishError(err.to_string())
            } else {
                AmqpError::ChannelClosedError(err.to_string())
            });
        }
    }
}

// Resolves once the owning publisher starts closing. A dropped publisher never
// resolves it; running operations keep going until their input ends.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
