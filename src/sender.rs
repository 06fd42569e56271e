// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Sender
//!
//! Caller-facing publishing side: resource management and the two publish
//! operations over one lazily created broker connection.

use crate::{
    channel::LapinConnector,
    client::{AmqpConnection, AmqpConnector},
    config::AmqpConfigs,
    connection::ConnectionManager,
    errors::AmqpError,
    message::OutboundMessage,
    publisher::{ConfirmStream, Publisher, SendOptions},
    resources::{BindingDefinition, ResourceController, ResourceOk, ResourceSpec},
};
use futures_util::stream::Stream;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

/// How long `close()` waits for outstanding confirmations by default.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct SenderOptions {
    close_timeout: Duration,
    connection: Option<Arc<dyn AmqpConnection>>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        SenderOptions {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            connection: None,
        }
    }
}

impl SenderOptions {
    pub fn new() -> Self {
        SenderOptions::default()
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Uses a connection owned by the caller. The sender never closes it.
    pub fn connection(mut self, connection: Arc<dyn AmqpConnection>) -> Self {
        self.connection = Some(connection);
        self
    }
}

impl fmt::Debug for SenderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderOptions")
            .field("close_timeout", &self.close_timeout)
            .field("caller_connection", &self.connection.is_some())
            .finish()
    }
}

pub struct Sender {
    connections: Arc<ConnectionManager>,
    resources: ResourceController,
    publisher: Publisher,
    close_timeout: Duration,
    closed: AtomicBool,
}

impl Sender {
    /// Creates a sender for the broker described by `cfg`.
    ///
    /// Nothing is opened until the first operation.
    ///
    /// # Parameters
    /// * `cfg` - Broker address and credentials
    /// * `options` - Close timeout and an optional caller-owned connection
    ///
    /// # Returns
    /// A sender backed by `lapin`
    pub fn new(cfg: &AmqpConfigs, options: SenderOptions) -> Self {
        Sender::with_connector(Arc::new(LapinConnector::new(cfg)), options)
    }

    /// Creates a sender over any client implementation.
    ///
    /// # Parameters
    /// * `connector` - Opens the connection on first use; unused when `options`
    ///   carries a connection
    /// * `options` - Close timeout and an optional caller-owned connection
    ///
    /// # Returns
    /// A sender that owns the connection it opens
    pub fn with_connector(connector: Arc<dyn AmqpConnector>, options: SenderOptions) -> Self {
        let connections = Arc::new(match options.connection {
            Some(connection) => ConnectionManager::with_connection(connection),
            None => ConnectionManager::new(connector),
        });

        Sender {
            resources: ResourceController::new(connections.clone()),
            publisher: Publisher::new(connections.clone()),
            connections,
            close_timeout: options.close_timeout,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::SenderClosed);
        }
        Ok(())
    }

    pub async fn declare(&self, spec: impl Into<ResourceSpec>) -> Result<ResourceOk, AmqpError> {
        self.ensure_open()?;
        self.resources.declare(spec).await
    }

    pub async fn delete(&self, spec: impl Into<ResourceSpec>) -> Result<ResourceOk, AmqpError> {
        self.ensure_open()?;
        self.resources.delete(spec).await
    }

    pub async fn bind(&self, binding: impl Into<BindingDefinition>) -> Result<ResourceOk, AmqpError> {
        self.ensure_open()?;
        self.resources.bind(binding).await
    }

    pub async fn unbind(
        &self,
        binding: impl Into<BindingDefinition>,
    ) -> Result<ResourceOk, AmqpError> {
        self.ensure_open()?;
        self.resources.unbind(binding).await
    }

    /// The resource controller, e.g. to install a [`crate::topology::AmqpTopology`].
    pub fn resources(&self) -> &ResourceController {
        &self.resources
    }

    /// See [`Publisher::send`].
    pub async fn send<S>(&self, messages: S) -> Result<(), AmqpError>
    where
        S: Stream<Item = OutboundMessage>,
    {
        self.ensure_open()?;
        self.publisher.send(messages).await
    }

    /// See [`Publisher::send_with_confirms`].
    pub fn send_with_confirms<S>(&self, messages: S, options: SendOptions) -> ConfirmStream
    where
        S: Stream<Item = OutboundMessage> + Send + 'static,
    {
        self.publisher.send_with_confirms(messages, options)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops accepting publishes, resolves outstanding confirmations (failing those
    /// still pending after the close timeout), then closes the publish channel and
    /// the connection if the sender opened it. Later calls are no-ops.
    ///
    /// Waits at most the close timeout plus [`crate::publisher::TERMINATE_GRACE`]
    /// for running operations.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("closing sender");
        let published = self.publisher.close(self.close_timeout).await;
        let connection = self.connections.close().await;
        published.and(connection)
    }
}
