// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Receiver
//!
//! Caller-facing consuming side. Each consume call returns an independent
//! [`ConsumerStream`] on its own channel; the receiver only keeps track of them so
//! that `close()` can cancel whatever is still running.

use crate::{
    acknowledgment::{AckMode, AcknowledgeableDelivery, Delivered},
    channel::LapinConnector,
    client::{AmqpConnection, AmqpConnector},
    config::AmqpConfigs,
    connection::ConnectionManager,
    consumer::{ConsumeOptions, ConsumerCore, ConsumerStream},
    errors::AmqpError,
    message::InboundDelivery,
};
use futures_util::future::join_all;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
};
use tracing::{debug, warn};

#[derive(Clone, Default)]
pub struct ReceiverOptions {
    connection: Option<Arc<dyn AmqpConnection>>,
}

impl ReceiverOptions {
    pub fn new() -> Self {
        ReceiverOptions::default()
    }

    /// Uses a connection owned by the caller. The receiver never closes it.
    pub fn connection(mut self, connection: Arc<dyn AmqpConnection>) -> Self {
        self.connection = Some(connection);
        self
    }
}

impl fmt::Debug for ReceiverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverOptions")
            .field("caller_connection", &self.connection.is_some())
            .finish()
    }
}

pub struct Receiver {
    connections: Arc<ConnectionManager>,
    // None once closed
    consumers: Mutex<Option<Vec<Weak<ConsumerCore>>>>,
}

impl Receiver {
    /// Creates a receiver for the broker described by `cfg`.
    ///
    /// # Parameters
    /// * `cfg` - Broker address and credentials
    /// * `options` - An optional caller-owned connection
    ///
    /// # Returns
    /// A receiver backed by `lapin` that connects on the first consume
    pub fn new(cfg: &AmqpConfigs, options: ReceiverOptions) -> Self {
        Receiver::with_connector(Arc::new(LapinConnector::new(cfg)), options)
    }

    /// Creates a receiver over any client implementation.
    ///
    /// # Parameters
    /// * `connector` - Opens the connection on first use; unused when `options`
    ///   carries a connection
    /// * `options` - An optional caller-owned connection
    pub fn with_connector(connector: Arc<dyn AmqpConnector>, options: ReceiverOptions) -> Self {
        let connections = match options.connection {
            Some(connection) => ConnectionManager::with_connection(connection),
            None => ConnectionManager::new(connector),
        };

        Receiver {
            connections: Arc::new(connections),
            consumers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Deliveries the broker considers acknowledged as soon as it sends them.
    pub fn consume_no_ack(
        &self,
        queue: &str,
        options: ConsumeOptions<InboundDelivery>,
    ) -> ConsumerStream<InboundDelivery> {
        self.consume(queue, AckMode::None, options)
    }

    /// Deliveries acknowledged right after they are handed to the caller, whether
    /// or not the caller goes on to process them.
    pub fn consume_auto_ack(
        &self,
        queue: &str,
        options: ConsumeOptions<InboundDelivery>,
    ) -> ConsumerStream<InboundDelivery> {
        self.consume(queue, AckMode::Auto, options)
    }

    /// Deliveries the caller acknowledges explicitly.
    pub fn consume_manual_ack(
        &self,
        queue: &str,
        options: ConsumeOptions<AcknowledgeableDelivery>,
    ) -> ConsumerStream<AcknowledgeableDelivery> {
        self.consume(queue, AckMode::Manual, options)
    }

    fn consume<T: Delivered>(
        &self,
        queue: &str,
        mode: AckMode,
        options: ConsumeOptions<T>,
    ) -> ConsumerStream<T> {
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(consumers) = consumers.as_mut() else {
            return ConsumerStream::failed(queue, mode, AmqpError::ReceiverClosed);
        };

        let stream = ConsumerStream::new(self.connections.clone(), queue, mode, options);
        consumers.retain(|core| core.strong_count() > 0);
        consumers.push(Arc::downgrade(stream.core()));
        stream
    }

    pub fn is_closed(&self) -> bool {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Cancels every running consumer, waits for their streams to complete, then
    /// closes the connection if the receiver opened it. Later calls are no-ops.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let consumers = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(consumers) = consumers else {
            return Ok(());
        };

        let running: Vec<Arc<ConsumerCore>> =
            consumers.iter().filter_map(Weak::upgrade).collect();
        debug!(consumers = running.len(), "closing receiver");

        for result in join_all(running.into_iter().map(ConsumerCore::cancel)).await {
            if let Err(err) = result {
                warn!(error = err.to_string(), "failure to cancel consumer on close");
            }
        }

        self.connections.close().await
    }
}
