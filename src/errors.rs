// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Bridge
//!
//! This module provides the error taxonomy shared by every component of the crate.
//! Connection-level errors are fatal to the owning Sender/Receiver, channel errors
//! fail only the operations bound to that channel, and resource, publish and consume
//! errors terminate the single operation that raised them.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// The enum is `Clone` because a single cause (typically a channel closure) is
/// used to fail every confirmation still pending on that channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// The broker connection could not be established or was lost
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// A channel could not be opened on the connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The channel bound to an operation was closed while it was in use
    #[error("channel closed: {0}")]
    ChannelClosedError(String),

    /// The broker rejected a declare, delete, bind or unbind call
    #[error("failure on resource `{resource}`: {code} {text}")]
    ResourceError {
        resource: String,
        code: u16,
        text: String,
    },

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// Consumer registration failed or the consumer died mid-stream
    #[error("failure to consume message: {0}")]
    ConsumeError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The sender was closed and no longer accepts publish calls
    #[error("sender closed")]
    SenderClosed,

    /// The receiver was closed and no longer accepts consume calls
    #[error("receiver closed")]
    ReceiverClosed,
}

impl AmqpError {
    /// Returns true when the error means the channel or connection is gone.
    pub fn is_channel_closed(&self) -> bool {
        matches!(
            self,
            AmqpError::ChannelClosedError(_) | AmqpError::ConnectionError(_)
        )
    }
}
