// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin-backed Broker Client
//!
//! This module adapts `lapin` connections and channels to the [`crate::client`]
//! traits. lapin resolves publisher confirms as one future per publish; the adapter
//! numbers publishes itself and a single forwarding task per channel awaits those
//! futures in publish order, turning each into a [`ConfirmListener::on_confirm`]
//! callback. A ranged ack resolves several futures at once, and they still reach the
//! listener in sequence order.

use crate::{
    client::{
        AmqpChannel, AmqpConnection, AmqpConnector, ConfirmListener, DeliveryListener,
        QueueDeclareOk, ShutdownListener,
    },
    config::AmqpConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{InboundDelivery, OutboundMessage},
    queue::QueueDefinition,
    resources::BindingDefinition,
};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use lapin::{
    message::DeliveryResult,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use opentelemetry::Context;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A publish awaiting its confirmation: sequence number and whether it was acked.
type PendingConfirm = (u64, BoxFuture<'static, bool>);

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections from [`AmqpConfigs`].
pub struct LapinConnector {
    uri: String,
    properties: ConnectionProperties,
}

impl LapinConnector {
    pub fn new(cfg: &AmqpConfigs) -> Self {
        LapinConnector {
            uri: cfg.uri(),
            properties: ConnectionProperties::default()
                .with_connection_name(LongString::from(cfg.connection_name.clone())),
        }
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");

        let conn = Connection::connect(&self.uri, self.properties.clone())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                AmqpError::ConnectionError(err.to_string())
            })?;

        debug!("amqp connected");
        Ok(Arc::new(LapinConnection { conn }))
    }
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");

        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>) {
        self.conn.on_error(move |err| {
            listener.on_shutdown(AmqpError::ConnectionError(err.to_string()));
        });
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
    confirms: Mutex<Option<mpsc::UnboundedSender<PendingConfirm>>>,
    next_seq_no: AtomicU64,
}

impl LapinChannel {
    fn new(channel: Channel) -> Self {
        LapinChannel {
            channel,
            confirms: Mutex::new(None),
            next_seq_no: AtomicU64::new(1),
        }
    }

    fn pending_confirms(&self) -> Option<mpsc::UnboundedSender<PendingConfirm>> {
        self.confirms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn closed_error(&self) -> AmqpError {
        AmqpError::ChannelClosedError(format!("channel {} is closed", self.channel.id()))
    }
}

/// Awaits confirmations one by one in publish order. Ends once the channel
/// adapter, which holds the sending side, is gone.
async fn forward_confirms(
    mut pending: mpsc::UnboundedReceiver<PendingConfirm>,
    listener: Arc<dyn ConfirmListener>,
) {
    while let Some((seq_no, acked)) = pending.recv().await {
        listener.on_confirm(seq_no, acked.await, false);
    }
}

fn resource_error(resource: &str, err: lapin::Error) -> AmqpError {
    let code = match &err {
        lapin::Error::ProtocolError(amqp) => amqp.get_id(),
        _ => 0,
    };
    error!(error = err.to_string(), resource, "broker rejected resource operation");

    AmqpError::ResourceError {
        resource: resource.to_owned(),
        code,
        text: err.to_string(),
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn enable_confirms(&self, listener: Arc<dyn ConfirmListener>) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })?;

        let (pending, pending_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_confirms(pending_rx, listener));
        *self.confirms.lock().unwrap_or_else(PoisonError::into_inner) = Some(pending);
        Ok(())
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.next_seq_no.load(Ordering::SeqCst)
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(self.closed_error());
        }

        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                message.wire_properties(&Context::current()),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishError(err.to_string())
            })?;

        let Some(pending) = self.pending_confirms() else {
            return Ok(());
        };

        let seq_no = self.next_seq_no.fetch_add(1, Ordering::SeqCst);
        let acked = async move {
            match confirm.await {
                Ok(confirmation) => confirmation.is_ack(),
                Err(err) => {
                    warn!(error = err.to_string(), seq_no, "publisher confirm failed");
                    false
                }
            }
        };
        if pending.send((seq_no, acked.boxed())).is_err() {
            warn!(seq_no, "confirm forwarder stopped");
        }

        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
            .map_err(|err| resource_error(&def.name, err))
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| resource_error(name, err))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueDeclareOk, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
            .map_err(|err| resource_error(&def.name, err))?;

        Ok(QueueDeclareOk {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| resource_error(name, err))
    }

    async fn bind(&self, binding: &BindingDefinition) -> Result<(), AmqpError> {
        let result = match binding {
            BindingDefinition::Queue(b) => {
                self.channel
                    .queue_bind(
                        &b.queue_name,
                        &b.exchange_name,
                        &b.routing_key,
                        QueueBindOptions::default(),
                        b.arguments(),
                    )
                    .await
            }
            BindingDefinition::Exchange(b) => {
                self.channel
                    .exchange_bind(
                        &b.destination,
                        &b.source,
                        &b.routing_key,
                        ExchangeBindOptions::default(),
                        b.arguments(),
                    )
                    .await
            }
        };

        result.map_err(|err| resource_error(&binding.to_string(), err))
    }

    async fn unbind(&self, binding: &BindingDefinition) -> Result<(), AmqpError> {
        let result = match binding {
            BindingDefinition::Queue(b) => {
                self.channel
                    .queue_unbind(&b.queue_name, &b.exchange_name, &b.routing_key, b.arguments())
                    .await
            }
            BindingDefinition::Exchange(b) => {
                self.channel
                    .exchange_unbind(
                        &b.destination,
                        &b.source,
                        &b.routing_key,
                        ExchangeUnbindOptions::default(),
                        b.arguments(),
                    )
                    .await
            }
        };

        result.map_err(|err| resource_error(&binding.to_string(), err))
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        listener: Arc<dyn DeliveryListener>,
    ) -> Result<String, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumeError(err.to_string())
            })?;

        let tag = consumer.tag().to_string();
        let delegate_tag = tag.clone();
        consumer.set_delegate(move |delivery: DeliveryResult| {
            let listener = listener.clone();
            let tag = delegate_tag.clone();
            async move {
                match delivery {
                    Ok(Some(delivery)) => listener.on_delivery(InboundDelivery::from(delivery)),
                    Ok(None) => listener.on_cancel(&tag),
                    Err(err) => listener.on_error(AmqpError::ConsumeError(err.to_string())),
                }
            }
        });

        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ConsumeError(err.to_string()))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::AckMessageError(self.closed_error().to_string()));
        }

        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::NackMessageError(self.closed_error().to_string()));
        }

        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>) {
        let id = self.channel.id();
        self.channel.on_error(move |err| {
            listener.on_shutdown(AmqpError::ChannelClosedError(format!(
                "channel {id}: {err}"
            )));
        });
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}
