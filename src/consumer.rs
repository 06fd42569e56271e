// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consume Engine
//!
//! Turns a broker consumer, which pushes deliveries through a callback whenever the
//! broker sends them, into a [`ConsumerStream`] the caller pulls from.
//!
//! Each stream moves through `Idle → Subscribing → Active → Cancelling → Closed`:
//! - nothing is registered on the broker until the stream is first polled;
//! - registration opens a dedicated channel, applies the prefetch window for the
//!   acknowledging modes and registers the consumer;
//! - deliveries are pushed into a [`Bridge`] and handed to the caller on demand;
//! - cancelling (explicitly, by the stop predicate, or by dropping the stream)
//!   deregisters the consumer and closes its channel before the stream completes;
//! - a channel that closes underneath an active consumer, or a consumer the broker
//!   cancels, fails the stream with a `ConsumeError`; a channel left open by the
//!   broker-side cancel is closed.

use crate::{
    acknowledgment::{AckMode, Delivered},
    bridge::{Bridge, OverflowStrategy, Pushed, DEFAULT_BUFFER_SIZE},
    client::{AmqpChannel, DeliveryListener, ShutdownListener},
    connection::ConnectionManager,
    errors::AmqpError,
    message::InboundDelivery,
};
use futures_util::{future::join_all, stream::Stream};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, OnceLock, PoisonError, Weak},
    task::{Context, Poll},
};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Unacknowledged deliveries the broker pushes before waiting for acks.
pub const DEFAULT_PREFETCH: u16 = 250;

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Per-consumer options.
pub struct ConsumeOptions<T> {
    overflow: OverflowStrategy,
    buffer_size: usize,
    prefetch: u16,
    consumer_tag: Option<String>,
    filter: Option<Predicate<T>>,
    stop_when: Option<Predicate<T>>,
}

impl<T> Default for ConsumeOptions<T> {
    fn default() -> Self {
        ConsumeOptions {
            overflow: OverflowStrategy::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            prefetch: DEFAULT_PREFETCH,
            consumer_tag: None,
            filter: None,
            stop_when: None,
        }
    }
}

impl<T> ConsumeOptions<T> {
    pub fn new() -> Self {
        ConsumeOptions::default()
    }

    pub fn overflow(mut self, strategy: OverflowStrategy) -> Self {
        self.overflow = strategy;
        self
    }

    /// Capacity of the delivery buffer for the bounded overflow strategies.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Prefetch window; ignored when the broker auto-acknowledges.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Consumer tag; a random one is generated otherwise.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    /// Only deliveries matching `filter` are emitted.
    ///
    /// Filtered-out deliveries are acknowledged in auto mode and left untouched in
    /// manual mode, where they stay unacknowledged until the channel closes.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Completes the stream after emitting the first delivery matching `stop`.
    pub fn stop_when<F>(mut self, stop: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.stop_when = Some(Arc::new(stop));
        self
    }
}

impl<T> Clone for ConsumeOptions<T> {
    fn clone(&self) -> Self {
        ConsumeOptions {
            overflow: self.overflow,
            buffer_size: self.buffer_size,
            prefetch: self.prefetch,
            consumer_tag: self.consumer_tag.clone(),
            filter: self.filter.clone(),
            stop_when: self.stop_when.clone(),
        }
    }
}

impl<T> fmt::Debug for ConsumeOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeOptions")
            .field("overflow", &self.overflow)
            .field("buffer_size", &self.buffer_size)
            .field("prefetch", &self.prefetch)
            .field("consumer_tag", &self.consumer_tag)
            .field("filter", &self.filter.is_some())
            .field("stop_when", &self.stop_when.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Subscribing,
    Active,
    Cancelling,
    Closed,
}

/// State shared between a stream, the broker callbacks and the receiver.
pub(crate) struct ConsumerCore {
    queue: String,
    tag: String,
    mode: AckMode,
    bridge: Bridge<InboundDelivery>,
    state: watch::Sender<ConsumerState>,
    channel: OnceLock<Arc<dyn AmqpChannel>>,
    // auto-acks in flight; awaited before the channel is closed
    acks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerCore {
    fn new(queue: &str, tag: String, mode: AckMode, overflow: OverflowStrategy, size: usize) -> Self {
        ConsumerCore {
            queue: queue.to_owned(),
            tag,
            mode,
            bridge: Bridge::new(overflow, size),
            state: watch::Sender::new(ConsumerState::Idle),
            channel: OnceLock::new(),
            acks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Applies `next` to the current state; returns the state before the call.
    fn transition(&self, next: impl FnOnce(ConsumerState) -> Option<ConsumerState>) -> ConsumerState {
        let mut prior = ConsumerState::Idle;
        self.state.send_if_modified(|state| {
            prior = *state;
            match next(*state) {
                Some(next) if next != *state => {
                    *state = next;
                    true
                }
                _ => false,
            }
        });
        prior
    }

    async fn subscribe(self: Arc<Self>, connections: Arc<ConnectionManager>, prefetch: u16) {
        match self.register(&connections, prefetch).await {
            Ok(()) => {
                let prior =
                    self.transition(|s| (s == ConsumerState::Subscribing).then_some(ConsumerState::Active));
                match prior {
                    ConsumerState::Subscribing => {
                        debug!(queue = self.queue, tag = self.tag, "consumer registered")
                    }
                    ConsumerState::Cancelling => {
                        let _ = self.deregister().await;
                    }
                    // failed while registering
                    ConsumerState::Closed => self.release_channel().await,
                    _ => {}
                }
            }
            Err(err) => {
                error!(error = err.to_string(), queue = self.queue, "failure to register consumer");
                let prior = self.transition(|_| Some(ConsumerState::Closed));
                self.bridge.complete(if prior == ConsumerState::Cancelling {
                    Ok(())
                } else {
                    Err(err)
                });
                if let Some(channel) = self.channel.get().filter(|ch| ch.is_open()) {
                    let _ = channel.close().await;
                }
            }
        }
    }

    async fn register(
        self: &Arc<Self>,
        connections: &ConnectionManager,
        prefetch: u16,
    ) -> Result<(), AmqpError> {
        let channel = connections.channel().await?;
        let channel = self.channel.get_or_init(|| channel).clone();

        channel.on_shutdown(Arc::new(ConsumerShutdown(Arc::downgrade(self))));

        if self.mode.uses_prefetch() {
            channel.qos(prefetch).await.map_err(|err| {
                AmqpError::QoSDeclarationError(format!("prefetch {prefetch}: {err}"))
            })?;
        }

        channel
            .consume(
                &self.queue,
                &self.tag,
                self.mode.broker_auto_ack(),
                Arc::new(ConsumerDeliveries(Arc::downgrade(self))),
            )
            .await
            .map_err(|err| match err {
                AmqpError::ConsumeError(_) => err,
                other => AmqpError::ConsumeError(other.to_string()),
            })?;

        Ok(())
    }

    /// Deregisters the consumer and completes the stream. Returns once the consumer
    /// is closed, whoever started the cancellation.
    pub(crate) async fn cancel(self: Arc<Self>) -> Result<(), AmqpError> {
        let prior = self.transition(|s| match s {
            ConsumerState::Idle => Some(ConsumerState::Closed),
            ConsumerState::Subscribing | ConsumerState::Active => Some(ConsumerState::Cancelling),
            _ => None,
        });

        match prior {
            ConsumerState::Idle => {
                self.bridge.complete(Ok(()));
                Ok(())
            }
            ConsumerState::Active => self.deregister().await,
            _ => {
                self.closed().await;
                self.release_channel().await;
                Ok(())
            }
        }
    }

    fn track_ack(&self, ack: Option<JoinHandle<()>>) {
        let Some(ack) = ack else {
            return;
        };
        let mut acks = self.acks.lock().unwrap_or_else(PoisonError::into_inner);
        acks.retain(|ack| !ack.is_finished());
        acks.push(ack);
    }

    async fn settle_acks(&self) {
        let acks = std::mem::take(&mut *self.acks.lock().unwrap_or_else(PoisonError::into_inner));
        if !acks.is_empty() {
            debug!(tag = self.tag, pending = acks.len(), "waiting for auto-acks");
            join_all(acks).await;
        }
    }

    async fn release_channel(&self) {
        if let Some(channel) = self.channel.get().filter(|ch| ch.is_open()) {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), tag = self.tag, "failure to close consumer channel");
            }
        }
    }

    async fn deregister(&self) -> Result<(), AmqpError> {
        let mut result = Ok(());

        // a closed channel would turn handed-off deliveries back into unacked ones
        self.settle_acks().await;

        if let Some(channel) = self.channel.get().filter(|ch| ch.is_open()) {
            if let Err(err) = channel.cancel(&self.tag).await {
                warn!(error = err.to_string(), tag = self.tag, "failure to cancel consumer");
                result = Err(AmqpError::ConsumeError(err.to_string()));
            }
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), tag = self.tag, "failure to close consumer channel");
            }
        }

        self.state.send_replace(ConsumerState::Closed);
        let discarded = self.bridge.abort(Ok(()));
        debug!(
            queue = self.queue,
            tag = self.tag,
            discarded = discarded.len(),
            "consumer deregistered"
        );
        result
    }

    async fn closed(&self) {
        let mut state = self.state.subscribe();
        loop {
            if *state.borrow_and_update() == ConsumerState::Closed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    fn accept(&self, delivery: InboundDelivery) {
        if !matches!(
            self.state(),
            ConsumerState::Subscribing | ConsumerState::Active
        ) {
            debug!(
                tag = self.tag,
                delivery_tag = delivery.delivery_tag,
                "delivery after cancellation left to the broker"
            );
            return;
        }

        match self.bridge.push(delivery) {
            Pushed::Queued => {}
            Pushed::Dropped(dropped) => warn!(
                queue = self.queue,
                delivery_tag = dropped.delivery_tag,
                "delivery buffer full, dropping delivery"
            ),
            Pushed::Overflow(dropped) => error!(
                queue = self.queue,
                delivery_tag = dropped.delivery_tag,
                "delivery buffer overflow, failing consumer"
            ),
            Pushed::Closed(_) => {}
        }
    }

    fn fail(&self, cause: AmqpError) {
        let prior = self.transition(|s| {
            matches!(s, ConsumerState::Subscribing | ConsumerState::Active)
                .then_some(ConsumerState::Closed)
        });
        if !matches!(prior, ConsumerState::Subscribing | ConsumerState::Active) {
            return;
        }
        warn!(error = cause.to_string(), queue = self.queue, tag = self.tag, "consumer failed");
        self.bridge.complete(Err(cause));

        // broker-side cancel leaves the channel open
        let channel = self.channel.get().filter(|ch| ch.is_open()).cloned();
        if let (Some(channel), Ok(runtime)) = (channel, Handle::try_current()) {
            let tag = self.tag.clone();
            runtime.spawn(async move {
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), tag = tag.as_str(), "failure to close consumer channel");
                }
            });
        }
    }
}

struct ConsumerDeliveries(Weak<ConsumerCore>);

impl DeliveryListener for ConsumerDeliveries {
    fn on_delivery(&self, delivery: InboundDelivery) {
        if let Some(core) = self.0.upgrade() {
            core.accept(delivery);
        }
    }

    fn on_cancel(&self, consumer_tag: &str) {
        if let Some(core) = self.0.upgrade() {
            core.fail(AmqpError::ConsumeError(format!(
                "consumer {consumer_tag} cancelled by broker"
            )));
        }
    }

    fn on_error(&self, cause: AmqpError) {
        if let Some(core) = self.0.upgrade() {
            core.fail(AmqpError::ConsumeError(cause.to_string()));
        }
    }
}

struct ConsumerShutdown(Weak<ConsumerCore>);

impl ShutdownListener for ConsumerShutdown {
    fn on_shutdown(&self, cause: AmqpError) {
        if let Some(core) = self.0.upgrade() {
            core.fail(AmqpError::ConsumeError(format!("consumer channel closed: {cause}")));
        }
    }
}

/// Deliveries of one consumer, registered on first poll.
///
/// Yields `Err` at most once, as its last item. Dropping an active stream
/// deregisters the consumer in the background; use [`ConsumerStream::cancel`] to
/// wait for it.
pub struct ConsumerStream<T> {
    core: Arc<ConsumerCore>,
    connections: Option<Arc<ConnectionManager>>,
    prefetch: u16,
    filter: Option<Predicate<T>>,
    stop_when: Option<Predicate<T>>,
    stopping: Option<JoinHandle<Result<(), AmqpError>>>,
    finished: bool,
}

impl<T: Delivered> ConsumerStream<T> {
    pub(crate) fn new(
        connections: Arc<ConnectionManager>,
        queue: &str,
        mode: AckMode,
        options: ConsumeOptions<T>,
    ) -> Self {
        debug_assert!(T::accepts(mode));

        let tag = options
            .consumer_tag
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        ConsumerStream {
            core: Arc::new(ConsumerCore::new(
                queue,
                tag,
                mode,
                options.overflow,
                options.buffer_size,
            )),
            connections: Some(connections),
            prefetch: options.prefetch,
            filter: options.filter,
            stop_when: options.stop_when,
            stopping: None,
            finished: false,
        }
    }

    /// A stream that only yields `cause`.
    pub(crate) fn failed(queue: &str, mode: AckMode, cause: AmqpError) -> Self {
        let core = ConsumerCore::new(queue, String::new(), mode, OverflowStrategy::Buffer, 1);
        core.state.send_replace(ConsumerState::Closed);
        core.bridge.complete(Err(cause));

        ConsumerStream {
            core: Arc::new(core),
            connections: None,
            prefetch: 0,
            filter: None,
            stop_when: None,
            stopping: None,
            finished: false,
        }
    }

    pub(crate) fn core(&self) -> &Arc<ConsumerCore> {
        &self.core
    }
}

impl<T> ConsumerStream<T> {
    pub fn state(&self) -> ConsumerState {
        self.core.state()
    }

    pub fn consumer_tag(&self) -> &str {
        &self.core.tag
    }

    pub fn queue(&self) -> &str {
        &self.core.queue
    }

    /// Deregisters the broker consumer and closes its channel. Deliveries still
    /// buffered are discarded; in the acknowledging modes the broker redelivers
    /// them.
    pub async fn cancel(&mut self) -> Result<(), AmqpError> {
        let result = self.core.clone().cancel().await;
        self.finished = true;
        result
    }

    fn start(&self) {
        let started = self.core.transition(|s| {
            (s == ConsumerState::Idle).then_some(ConsumerState::Subscribing)
        });
        if started != ConsumerState::Idle {
            return;
        }
        if let Some(connections) = &self.connections {
            tokio::spawn(
                self.core
                    .clone()
                    .subscribe(connections.clone(), self.prefetch),
            );
        }
    }
}

impl<T: Delivered> Stream for ConsumerStream<T> {
    type Item = Result<T, AmqpError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(stopping) = this.stopping.as_mut() {
            let outcome = futures_util::ready!(Pin::new(stopping).poll(cx));
            this.stopping = None;
            this.finished = true;
            if let Ok(Err(err)) = outcome {
                warn!(error = err.to_string(), "failure to stop consumer");
            }
            return Poll::Ready(None);
        }

        this.start();

        loop {
            let delivery = match this.core.bridge.poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(err))) => {
                    // overflow or broker-side failure; make sure nothing stays registered
                    if this.core.state() == ConsumerState::Active {
                        tokio::spawn(this.core.clone().cancel());
                    }
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(Some(Ok(delivery))) => delivery,
            };

            let Some(channel) = this.core.channel.get() else {
                continue;
            };
            let mode = this.core.mode;
            let delivery_tag = delivery.delivery_tag;
            let item = T::wrap(delivery, channel);

            if this.filter.as_ref().is_some_and(|filter| !filter(&item)) {
                this.core.track_ack(mode.on_handoff(delivery_tag, channel));
                continue;
            }

            this.core.track_ack(mode.on_handoff(delivery_tag, channel));

            if this.stop_when.as_ref().is_some_and(|stop| stop(&item)) {
                debug!(tag = this.core.tag, delivery_tag, "stop predicate matched");
                this.stopping = Some(tokio::spawn(this.core.clone().cancel()));
            }

            return Poll::Ready(Some(Ok(item)));
        }
    }
}

impl<T> Drop for ConsumerStream<T> {
    fn drop(&mut self) {
        if !matches!(
            self.core.state(),
            ConsumerState::Subscribing | ConsumerState::Active
        ) {
            return;
        }
        if let Ok(runtime) = Handle::try_current() {
            runtime.spawn(self.core.clone().cancel());
        }
    }
}

impl<T> fmt::Debug for ConsumerStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerStream")
            .field("queue", &self.core.queue)
            .field("tag", &self.core.tag)
            .field("mode", &self.core.mode)
            .field("state", &self.core.state())
            .finish()
    }
}
