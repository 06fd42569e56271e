// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resource Controller
//!
//! Declares and deletes exchanges, queues and bindings. Every operation acquires its
//! own channel, issues one broker call and closes the channel again, so independent
//! operations may run concurrently. Nothing orders two calls except the caller
//! awaiting one before starting the next.

use crate::{
    client::{AmqpChannel, QueueDeclareOk},
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use std::{fmt, sync::Arc};
use tracing::{debug, warn};

/// A queue-to-exchange or exchange-to-exchange binding.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingDefinition {
    Queue(QueueBinding),
    Exchange(ExchangeBinding),
}

impl From<QueueBinding> for BindingDefinition {
    fn from(binding: QueueBinding) -> Self {
        BindingDefinition::Queue(binding)
    }
}

impl From<ExchangeBinding> for BindingDefinition {
    fn from(binding: ExchangeBinding) -> Self {
        BindingDefinition::Exchange(binding)
    }
}

impl fmt::Display for BindingDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingDefinition::Queue(b) => write!(
                f,
                "{} -[{}]-> queue {}",
                b.exchange_name, b.routing_key, b.queue_name
            ),
            BindingDefinition::Exchange(b) => write!(
                f,
                "{} -[{}]-> exchange {}",
                b.source, b.routing_key, b.destination
            ),
        }
    }
}

/// Any declarable broker resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(BindingDefinition),
}

impl From<ExchangeDefinition> for ResourceSpec {
    fn from(def: ExchangeDefinition) -> Self {
        ResourceSpec::Exchange(def)
    }
}

impl From<QueueDefinition> for ResourceSpec {
    fn from(def: QueueDefinition) -> Self {
        ResourceSpec::Queue(def)
    }
}

impl From<BindingDefinition> for ResourceSpec {
    fn from(def: BindingDefinition) -> Self {
        ResourceSpec::Binding(def)
    }
}

impl From<QueueBinding> for ResourceSpec {
    fn from(def: QueueBinding) -> Self {
        ResourceSpec::Binding(def.into())
    }
}

impl From<ExchangeBinding> for ResourceSpec {
    fn from(def: ExchangeBinding) -> Self {
        ResourceSpec::Binding(def.into())
    }
}

/// Broker acknowledgment of a resource operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOk {
    ExchangeDeclared { name: String },
    QueueDeclared(QueueDeclareOk),
    Bound,
    ExchangeDeleted { name: String },
    QueueDeleted { name: String, message_count: u32 },
    Unbound,
}

/// Issues declare/delete/bind/unbind calls on behalf of a Sender.
#[derive(Clone)]
pub struct ResourceController {
    connections: Arc<ConnectionManager>,
}

impl ResourceController {
    /// # Parameters
    /// * `connections` - Source of the short-lived channel each operation uses
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        ResourceController { connections }
    }

    /// Declares an exchange, a queue, or a binding.
    pub async fn declare(&self, spec: impl Into<ResourceSpec>) -> Result<ResourceOk, AmqpError> {
        let spec = spec.into();
        let channel = self.connections.channel().await?;

        let result = match &spec {
            ResourceSpec::Exchange(def) => {
                debug!("creating exchange: {}", def.name);
                channel
                    .declare_exchange(def)
                    .await
                    .map(|_| ResourceOk::ExchangeDeclared {
                        name: def.name.clone(),
                    })
            }
            ResourceSpec::Queue(def) => {
                debug!("creating queue: {}", def.name);
                channel.declare_queue(def).await.map(ResourceOk::QueueDeclared)
            }
            ResourceSpec::Binding(binding) => {
                debug!("binding {}", binding);
                channel.bind(binding).await.map(|_| ResourceOk::Bound)
            }
        };

        release(channel).await;
        result
    }

    /// Deletes an exchange or a queue; for a binding this is an unbind.
    pub async fn delete(&self, spec: impl Into<ResourceSpec>) -> Result<ResourceOk, AmqpError> {
        let spec = spec.into();
        let channel = self.connections.channel().await?;

        let result = match &spec {
            ResourceSpec::Exchange(def) => {
                debug!("deleting exchange: {}", def.name);
                channel
                    .delete_exchange(&def.name)
                    .await
                    .map(|_| ResourceOk::ExchangeDeleted {
                        name: def.name.clone(),
                    })
            }
            ResourceSpec::Queue(def) => {
                debug!("deleting queue: {}", def.name);
                channel
                    .delete_queue(&def.name)
                    .await
                    .map(|message_count| ResourceOk::QueueDeleted {
                        name: def.name.clone(),
                        message_count,
                    })
            }
            ResourceSpec::Binding(binding) => {
                debug!("unbinding {}", binding);
                channel.unbind(binding).await.map(|_| ResourceOk::Unbound)
            }
        };

        release(channel).await;
        result
    }

    pub async fn bind(&self, binding: impl Into<BindingDefinition>) -> Result<ResourceOk, AmqpError> {
        self.declare(ResourceSpec::Binding(binding.into())).await
    }

    pub async fn unbind(
        &self,
        binding: impl Into<BindingDefinition>,
    ) -> Result<ResourceOk, AmqpError> {
        self.delete(ResourceSpec::Binding(binding.into())).await
    }
}

// A rejected operation usually leaves the channel closed by the broker already.
async fn release(channel: Arc<dyn AmqpChannel>) {
    if let Err(err) = channel.close().await {
        warn!(error = err.to_string(), "failure to close resource channel");
    }
}
