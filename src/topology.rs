// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declarative installation of a set of exchanges, queues and bindings. Every
//! declaration goes through the [`ResourceController`] and is awaited before the
//! next one starts, so each resource exists before anything that refers to it:
//! exchanges first, then queues (retry and DLQ companions before the queue that
//! dead-letters into them), then exchange bindings and queue bindings.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
    resources::{ResourceController, ResourceSpec},
};
use async_trait::async_trait;
use tracing::{debug, error};

/// Interface for topology management.
#[async_trait]
pub trait Topology {
    fn exchange(self, def: ExchangeDefinition) -> Self;

    fn queue(self, def: QueueDefinition) -> Self;

    fn exchange_binding(self, binding: ExchangeBinding) -> Self;

    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares everything registered so far, in dependency order. Stops at the
    /// first rejected declaration.
    async fn install(&self) -> Result<(), AmqpError>;
}

pub struct AmqpTopology {
    resources: ResourceController,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) exchanges_binding: Vec<ExchangeBinding>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    /// Creates an empty topology.
    ///
    /// # Parameters
    /// * `resources` - The controller `install` declares through
    ///
    /// # Returns
    /// A topology ready for chained registrations
    pub fn new(resources: ResourceController) -> AmqpTopology {
        AmqpTopology {
            resources,
            exchanges: vec![],
            queues: vec![],
            exchanges_binding: vec![],
            queues_binding: vec![],
        }
    }

    /// Declaration order, companions included.
    pub(crate) fn plan(&self) -> Vec<ResourceSpec> {
        let mut plan: Vec<ResourceSpec> = self
            .exchanges
            .iter()
            .cloned()
            .map(ResourceSpec::from)
            .collect();

        for queue in &self.queues {
            plan.extend(queue.retry_queue().map(ResourceSpec::from));
            plan.extend(queue.dlq().map(ResourceSpec::from));
            plan.push(queue.clone().into());
        }

        plan.extend(self.exchanges_binding.iter().cloned().map(ResourceSpec::from));
        plan.extend(self.queues_binding.iter().cloned().map(ResourceSpec::from));
        plan
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Registers a queue; a queue with the same name replaces the earlier one.
    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|queue| queue.name != def.name);
        self.queues.push(def);
        self
    }

    fn exchange_binding(mut self, binding: ExchangeBinding) -> Self {
        self.exchanges_binding.push(binding);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        for spec in self.plan() {
            debug!(?spec, "installing");
            if let Err(err) = self.resources.declare(spec).await {
                error!(error = err.to_string(), "failure to install topology");
                return Err(err);
            }
        }
        Ok(())
    }
}
