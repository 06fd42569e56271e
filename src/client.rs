// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Boundary
//!
//! The engines in this crate never talk to a wire-protocol client directly. They use
//! the traits below, which mirror the callback-style primitives of a low-level AMQP
//! client: connections open channels, channels publish, declare and consume, and the
//! broker reports confirmations, deliveries and shutdowns through listeners invoked on
//! the client's own I/O context.
//!
//! [`crate::channel`] implements these traits on top of `lapin`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{InboundDelivery, OutboundMessage},
    queue::QueueDefinition,
    resources::BindingDefinition,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives publisher confirmations for a channel in confirm mode.
pub trait ConfirmListener: Send + Sync {
    /// `multiple` means every sequence number up to and including `seq_no`.
    fn on_confirm(&self, seq_no: u64, ack: bool, multiple: bool);
}

/// Receives the messages pushed to a registered consumer.
pub trait DeliveryListener: Send + Sync {
    fn on_delivery(&self, delivery: InboundDelivery);

    /// The broker cancelled the consumer.
    fn on_cancel(&self, consumer_tag: &str);

    /// The client failed to deliver to this consumer.
    fn on_error(&self, cause: AmqpError);
}

/// Notified once when a channel or connection shuts down.
pub trait ShutdownListener: Send + Sync {
    fn on_shutdown(&self, cause: AmqpError);
}

/// Broker reply to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    /// Queue name, generated by the broker when the declaration left it empty
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// An open broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Opens a new channel; fails when the connection is gone or the broker refuses
    /// the channel (e.g. channel-max reached).
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// An AMQP channel.
///
/// Publishing on a channel is not safe from several uncoordinated callers; the
/// publish engine serializes its writes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Puts the channel in confirm mode and routes confirmations to `listener`.
    async fn enable_confirms(&self, listener: Arc<dyn ConfirmListener>) -> Result<(), AmqpError>;

    /// Sequence number the next publish on this channel will be assigned.
    fn next_publish_seq_no(&self) -> u64;

    /// Hands a message to the client. Returns once the write is accepted, not
    /// when the broker confirms it.
    async fn publish(&self, message: &OutboundMessage) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueDeclareOk, AmqpError>;

    /// Returns the number of messages deleted with the queue.
    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError>;

    async fn bind(&self, binding: &BindingDefinition) -> Result<(), AmqpError>;

    async fn unbind(&self, binding: &BindingDefinition) -> Result<(), AmqpError>;

    /// Caps the unacknowledged deliveries pushed to consumers of this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Registers a consumer and returns its tag. With `auto_ack` the broker
    /// considers every message acknowledged as soon as it is sent.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        listener: Arc<dyn DeliveryListener>,
    ) -> Result<String, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>);

    async fn close(&self) -> Result<(), AmqpError>;
}
