// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Bridge
//!
//! Bridges the callback-driven `lapin` client to pull-based streams in both
//! directions: publishing with broker confirmations correlated per message, and
//! consuming with a choice of acknowledgment modes.
//!
//! [`sender::Sender`] and [`receiver::Receiver`] are the entry points; both open
//! their broker connection on first use.

mod bridge;
mod ledger;
mod otel;

#[cfg(test)]
mod fake;

pub mod acknowledgment;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod receiver;
pub mod resources;
pub mod sender;
pub mod topology;

pub use acknowledgment::{AckMode, AcknowledgeableDelivery};
pub use bridge::{OverflowStrategy, DEFAULT_BUFFER_SIZE};
pub use config::AmqpConfigs;
pub use consumer::{ConsumeOptions, ConsumerState, ConsumerStream};
pub use errors::AmqpError;
pub use message::{HeaderValue, InboundDelivery, OutboundMessage, OutboundMessageResult};
pub use publisher::{ConfirmStream, SendOptions};
pub use receiver::{Receiver, ReceiverOptions};
pub use sender::{Sender, SenderOptions};
