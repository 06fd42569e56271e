// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the client traits for tests.
//!
//! Listener callbacks are invoked after the broker lock is released, from whatever
//! task drove the broker call, the way a client I/O thread calls back into user code.

use crate::{
    client::{
        AmqpChannel, AmqpConnection, AmqpConnector, ConfirmListener, DeliveryListener,
        QueueDeclareOk, ShutdownListener,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{InboundDelivery, OutboundMessage},
    queue::QueueDefinition,
    resources::BindingDefinition,
};
use async_trait::async_trait;
use lapin::BasicProperties;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use uuid::Uuid;

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    connection: usize,
    open: bool,
    confirms: Option<Arc<dyn ConfirmListener>>,
    next_seq_no: u64,
    prefetch: u16,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    published: usize,
    shutdown: Vec<Arc<dyn ShutdownListener>>,
}

struct ConsumerEntry {
    tag: String,
    queue: String,
    channel: u16,
    auto_ack: bool,
    listener: Arc<dyn DeliveryListener>,
}

struct ConnectionState {
    open: bool,
    shutdown: Vec<Arc<dyn ShutdownListener>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    bindings: Vec<(String, String, String)>,
    exchange_bindings: Vec<(String, String, String)>,
    consumers: Vec<ConsumerEntry>,
    channels: HashMap<u16, ChannelState>,
    connections: Vec<ConnectionState>,
    next_channel_id: u16,
    channels_opened: usize,
    channel_max: Option<usize>,
    auto_confirm: bool,
    close_after_publishes: Option<usize>,
    last_confirm_channel: Option<u16>,
    published: Vec<OutboundMessage>,
    acks: Vec<u64>,
    nacks: Vec<u64>,
}

type Dispatch = Vec<(Arc<dyn DeliveryListener>, InboundDelivery)>;

impl BrokerState {
    fn channel(&mut self, id: u16) -> Result<&mut ChannelState, AmqpError> {
        match self.channels.get_mut(&id) {
            Some(ch) if ch.open => Ok(ch),
            _ => Err(AmqpError::ChannelClosedError(format!("channel {id} is closed"))),
        }
    }

    fn route(&mut self, message: &OutboundMessage) {
        let mut targets = Vec::new();
        if message.exchange.is_empty() {
            targets.push(message.routing_key.clone());
        } else {
            let fanout = self.exchanges.get(&message.exchange) == Some(&ExchangeKind::Fanout);
            for (exchange, key, queue) in &self.bindings {
                if *exchange == message.exchange && (fanout || *key == message.routing_key) {
                    targets.push(queue.clone());
                }
            }
        }

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.push_back(StoredMessage {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    properties: message.properties.clone(),
                    body: message.body.clone(),
                    redelivered: false,
                });
            }
        }
    }

    fn dispatch(&mut self) -> Dispatch {
        let mut out = Vec::new();

        loop {
            let mut progress = false;

            for consumer in &self.consumers {
                let Some(ch) = self.channels.get_mut(&consumer.channel) else {
                    continue;
                };
                if !ch.open {
                    continue;
                }
                if !consumer.auto_ack
                    && ch.prefetch > 0
                    && ch.unacked.len() >= usize::from(ch.prefetch)
                {
                    continue;
                }
                let Some(message) = self
                    .queues
                    .get_mut(&consumer.queue)
                    .and_then(|queue| queue.pop_front())
                else {
                    continue;
                };

                let tag = ch.next_delivery_tag;
                ch.next_delivery_tag += 1;
                if !consumer.auto_ack {
                    ch.unacked.insert(
                        tag,
                        Unacked {
                            queue: consumer.queue.clone(),
                            message: message.clone(),
                        },
                    );
                }

                out.push((
                    consumer.listener.clone(),
                    InboundDelivery {
                        delivery_tag: tag,
                        exchange: message.exchange,
                        routing_key: message.routing_key,
                        redelivered: message.redelivered,
                        properties: message.properties,
                        body: message.body,
                    },
                ));
                progress = true;
            }

            if !progress {
                return out;
            }
        }
    }

    fn requeue(&mut self, tags: Vec<u64>, channel: u16) {
        let Some(ch) = self.channels.get_mut(&channel) else {
            return;
        };
        let mut messages: Vec<Unacked> = tags
            .into_iter()
            .filter_map(|tag| ch.unacked.remove(&tag))
            .collect();
        messages.reverse();

        for Unacked { queue, mut message } in messages {
            message.redelivered = true;
            if let Some(queue) = self.queues.get_mut(&queue) {
                queue.push_front(message);
            }
        }
    }

    fn close_channel(&mut self, id: u16) -> Vec<Arc<dyn ShutdownListener>> {
        let Some(ch) = self.channels.get_mut(&id) else {
            return Vec::new();
        };
        if !ch.open {
            return Vec::new();
        }
        ch.open = false;
        ch.confirms = None;
        let listeners = std::mem::take(&mut ch.shutdown);
        let tags: Vec<u64> = ch.unacked.keys().copied().collect();

        self.consumers.retain(|consumer| consumer.channel != id);
        self.requeue(tags, id);
        listeners
    }
}

/// Handle on the in-memory broker; clones share state.
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        let broker = FakeBroker::default();
        broker.lock().next_channel_id = 1;
        broker
    }

    /// Refuse new channels once a connection has `max` open channels.
    pub(crate) fn channel_max(self, max: usize) -> Self {
        self.lock().channel_max = Some(max);
        self
    }

    /// Ack every publish on confirm channels as soon as it is written.
    pub(crate) fn auto_confirm(self) -> Self {
        self.lock().auto_confirm = true;
        self
    }

    /// Close a channel from the broker side right after its n-th publish.
    pub(crate) fn close_channel_after_publishes(self, n: usize) -> Self {
        self.lock().close_after_publishes = Some(n);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn connector(&self) -> Arc<dyn AmqpConnector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    pub(crate) fn connection(&self) -> Arc<dyn AmqpConnection> {
        let mut state = self.lock();
        state.connections.push(ConnectionState {
            open: true,
            shutdown: Vec::new(),
        });
        Arc::new(FakeConnection {
            id: state.connections.len() - 1,
            broker: self.clone(),
        })
    }

    /// Puts messages on a queue through the default exchange, creating the queue.
    pub(crate) fn enqueue(&self, queue: &str, bodies: &[&[u8]]) {
        let deliveries = {
            let mut state = self.lock();
            state.queues.entry(queue.to_owned()).or_default();
            for body in bodies {
                state.route(&OutboundMessage::new("", queue, body.to_vec()));
            }
            state.dispatch()
        };
        deliver(deliveries);
    }

    pub(crate) fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub(crate) fn has_binding(&self, exchange: &str, routing_key: &str, queue: &str) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|(e, k, q)| e == exchange && k == routing_key && q == queue)
    }

    pub(crate) fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub(crate) fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .consumers
            .iter()
            .filter(|consumer| consumer.queue == queue)
            .count()
    }

    pub(crate) fn consumer_auto_ack(&self, queue: &str) -> Option<bool> {
        self.lock()
            .consumers
            .iter()
            .find(|consumer| consumer.queue == queue)
            .map(|consumer| consumer.auto_ack)
    }

    pub(crate) fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    pub(crate) fn open_channels(&self) -> usize {
        self.lock().channels.values().filter(|ch| ch.open).count()
    }

    pub(crate) fn published(&self) -> Vec<OutboundMessage> {
        self.lock().published.clone()
    }

    pub(crate) fn acks(&self) -> Vec<u64> {
        self.lock().acks.clone()
    }

    pub(crate) fn nacks(&self) -> Vec<u64> {
        self.lock().nacks.clone()
    }

    pub(crate) fn confirm_channel(&self) -> Option<u16> {
        self.lock().last_confirm_channel
    }

    /// Waits until `n` messages have been published.
    pub(crate) async fn wait_for_published(&self, n: usize) {
        for _ in 0..500 {
            if self.lock().published.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for {n} publishes");
    }

    /// Waits until the latest confirm-mode channel exists.
    pub(crate) async fn wait_for_confirm_channel(&self) -> u16 {
        for _ in 0..500 {
            if let Some(id) = self.confirm_channel() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for a confirm channel");
    }

    /// Sends a publisher confirmation on `channel`, the way the broker would.
    pub(crate) fn confirm(&self, channel: u16, seq_no: u64, ack: bool, multiple: bool) {
        let listener = self
            .lock()
            .channels
            .get(&channel)
            .and_then(|ch| ch.confirms.clone());
        if let Some(listener) = listener {
            listener.on_confirm(seq_no, ack, multiple);
        }
    }

    /// Closes a channel from the broker side.
    pub(crate) fn kill_channel(&self, channel: u16) {
        let (listeners, deliveries) = {
            let mut state = self.lock();
            let listeners = state.close_channel(channel);
            (listeners, state.dispatch())
        };
        deliver(deliveries);
        for listener in listeners {
            listener.on_shutdown(AmqpError::ChannelClosedError(format!(
                "channel {channel} closed by broker"
            )));
        }
    }

    /// Closes the channel of the first consumer registered on `queue`.
    pub(crate) fn kill_consumer_channel(&self, queue: &str) {
        let channel = self
            .lock()
            .consumers
            .iter()
            .find(|consumer| consumer.queue == queue)
            .map(|consumer| consumer.channel);
        if let Some(channel) = channel {
            self.kill_channel(channel);
        }
    }

    fn fail(&self, channel: u16, resource: &str, code: u16, text: &str) -> AmqpError {
        self.kill_channel(channel);
        AmqpError::ResourceError {
            resource: resource.to_owned(),
            code,
            text: text.to_owned(),
        }
    }
}

fn deliver(deliveries: Dispatch) {
    for (listener, delivery) in deliveries {
        listener.on_delivery(delivery);
    }
}

struct FakeConnector {
    broker: FakeBroker,
}

#[async_trait]
impl AmqpConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        Ok(self.broker.connection())
    }
}

struct FakeConnection {
    id: usize,
    broker: FakeBroker,
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.broker.lock();
        if !state.connections[self.id].open {
            return Err(AmqpError::ConnectionError("connection is closed".to_owned()));
        }
        let open = state
            .channels
            .values()
            .filter(|ch| ch.open && ch.connection == self.id)
            .count();
        if state.channel_max.is_some_and(|max| open >= max) {
            return Err(AmqpError::ChannelError("channel max reached".to_owned()));
        }

        let id = state.next_channel_id;
        state.next_channel_id += 1;
        state.channels_opened += 1;
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                confirms: None,
                next_seq_no: 1,
                prefetch: 0,
                next_delivery_tag: 1,
                unacked: BTreeMap::new(),
                published: 0,
                shutdown: Vec::new(),
            },
        );

        Ok(Arc::new(FakeChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        self.broker.lock().connections[self.id].open
    }

    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>) {
        self.broker.lock().connections[self.id].shutdown.push(listener);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let (channels, listeners) = {
            let mut state = self.broker.lock();
            let conn = &mut state.connections[self.id];
            conn.open = false;
            let listeners = std::mem::take(&mut conn.shutdown);
            let channels: Vec<u16> = state
                .channels
                .iter()
                .filter(|(_, ch)| ch.open && ch.connection == self.id)
                .map(|(id, _)| *id)
                .collect();
            (channels, listeners)
        };

        for channel in channels {
            self.broker.kill_channel(channel);
        }
        for listener in listeners {
            listener.on_shutdown(AmqpError::ConnectionError("connection closed".to_owned()));
        }
        Ok(())
    }
}

struct FakeChannel {
    id: u16,
    broker: FakeBroker,
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .is_some_and(|ch| ch.open)
    }

    async fn enable_confirms(&self, listener: Arc<dyn ConfirmListener>) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let ch = state.channel(self.id)?;
        ch.confirms = Some(listener);
        ch.next_seq_no = 1;
        state.last_confirm_channel = Some(self.id);
        Ok(())
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .map_or(0, |ch| ch.next_seq_no)
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), AmqpError> {
        let (deliveries, confirm, close) = {
            let mut state = self.broker.lock();
            let auto_confirm = state.auto_confirm;
            let close_after = state.close_after_publishes;

            let ch = state.channel(self.id)?;
            ch.published += 1;
            let seq_no = ch.next_seq_no;
            let confirm = match &ch.confirms {
                Some(listener) => {
                    ch.next_seq_no += 1;
                    auto_confirm.then(|| (listener.clone(), seq_no))
                }
                None => None,
            };
            let close = close_after == Some(ch.published);

            state.published.push(message.clone());
            state.route(message);
            (state.dispatch(), confirm, close)
        };

        deliver(deliveries);
        if let Some((listener, seq_no)) = confirm {
            listener.on_confirm(seq_no, true, false);
        }
        if close {
            self.broker.kill_channel(self.id);
        }
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let existing = {
            let mut state = self.broker.lock();
            state.channel(self.id)?;
            state.exchanges.get(&def.name).cloned()
        };

        match existing {
            Some(kind) if kind != def.kind => Err(self.broker.fail(
                self.id,
                &def.name,
                406,
                "PRECONDITION_FAILED - inequivalent arg 'type'",
            )),
            Some(_) => Ok(()),
            None if def.passive => Err(self.broker.fail(self.id, &def.name, 404, "NOT_FOUND")),
            None => {
                self.broker
                    .lock()
                    .exchanges
                    .insert(def.name.clone(), def.kind.clone());
                Ok(())
            }
        }
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        state.exchanges.remove(name);
        state.bindings.retain(|(exchange, _, _)| exchange != name);
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueDeclareOk, AmqpError> {
        let result = {
            let mut state = self.broker.lock();
            state.channel(self.id)?;

            let name = if def.name.is_empty() {
                format!("amq.gen-{}", Uuid::new_v4())
            } else {
                def.name.clone()
            };

            if def.passive && !state.queues.contains_key(&name) {
                None
            } else {
                let message_count = state.queues.entry(name.clone()).or_default().len();
                let consumer_count = state
                    .consumers
                    .iter()
                    .filter(|consumer| consumer.queue == name)
                    .count();
                Some(QueueDeclareOk {
                    name,
                    message_count: message_count as u32,
                    consumer_count: consumer_count as u32,
                })
            }
        };

        result.ok_or_else(|| self.broker.fail(self.id, &def.name, 404, "NOT_FOUND"))
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let (count, cancelled) = {
            let mut state = self.broker.lock();
            state.channel(self.id)?;
            let count = state.queues.remove(name).map_or(0, |queue| queue.len());
            state.bindings.retain(|(_, _, queue)| queue != name);

            let mut cancelled = Vec::new();
            state.consumers.retain(|consumer| {
                if consumer.queue == name {
                    cancelled.push((consumer.listener.clone(), consumer.tag.clone()));
                    false
                } else {
                    true
                }
            });
            (count, cancelled)
        };

        for (listener, tag) in cancelled {
            listener.on_cancel(&tag);
        }
        Ok(count as u32)
    }

    async fn bind(&self, binding: &BindingDefinition) -> Result<(), AmqpError> {
        let missing = {
            let mut state = self.broker.lock();
            state.channel(self.id)?;
            match binding {
                BindingDefinition::Queue(b) => {
                    let exists = state.exchanges.contains_key(&b.exchange_name)
                        && state.queues.contains_key(&b.queue_name);
                    if exists {
                        state.bindings.push((
                            b.exchange_name.clone(),
                            b.routing_key.clone(),
                            b.queue_name.clone(),
                        ));
                    }
                    !exists
                }
                BindingDefinition::Exchange(b) => {
                    let exists = state.exchanges.contains_key(&b.source)
                        && state.exchanges.contains_key(&b.destination);
                    if exists {
                        state.exchange_bindings.push((
                            b.source.clone(),
                            b.routing_key.clone(),
                            b.destination.clone(),
                        ));
                    }
                    !exists
                }
            }
        };

        if missing {
            return Err(self.broker.fail(self.id, &binding.to_string(), 404, "NOT_FOUND"));
        }
        Ok(())
    }

    async fn unbind(&self, binding: &BindingDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        match binding {
            BindingDefinition::Queue(b) => state.bindings.retain(|(e, k, q)| {
                !(*e == b.exchange_name && *k == b.routing_key && *q == b.queue_name)
            }),
            BindingDefinition::Exchange(b) => state.exchange_bindings.retain(|(s, k, d)| {
                !(*s == b.source && *k == b.routing_key && *d == b.destination)
            }),
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        listener: Arc<dyn DeliveryListener>,
    ) -> Result<String, AmqpError> {
        let registered = {
            let mut state = self.broker.lock();
            state.channel(self.id)?;
            if state.queues.contains_key(queue) {
                let tag = if consumer_tag.is_empty() {
                    format!("amq.ctag-{}", Uuid::new_v4())
                } else {
                    consumer_tag.to_owned()
                };
                state.consumers.push(ConsumerEntry {
                    tag: tag.clone(),
                    queue: queue.to_owned(),
                    channel: self.id,
                    auto_ack,
                    listener,
                });
                Some((tag, state.dispatch()))
            } else {
                None
            }
        };

        let Some((tag, deliveries)) = registered else {
            self.broker.kill_channel(self.id);
            return Err(AmqpError::ConsumeError(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        };

        deliver(deliveries);
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        state.consumers.retain(|consumer| consumer.tag != consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        let deliveries = {
            let mut state = self.broker.lock();
            let ch = state
                .channel(self.id)
                .map_err(|err| AmqpError::AckMessageError(err.to_string()))?;

            let tags: Vec<u64> = if multiple {
                ch.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
            } else {
                vec![delivery_tag]
            };
            for tag in &tags {
                if ch.unacked.remove(tag).is_none() {
                    return Err(AmqpError::AckMessageError(format!(
                        "unknown delivery tag {tag}"
                    )));
                }
            }
            state.acks.extend(tags);
            state.dispatch()
        };

        deliver(deliveries);
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let deliveries = {
            let mut state = self.broker.lock();
            let ch = state
                .channel(self.id)
                .map_err(|err| AmqpError::NackMessageError(err.to_string()))?;

            let tags: Vec<u64> = if multiple {
                ch.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
            } else if ch.unacked.contains_key(&delivery_tag) {
                vec![delivery_tag]
            } else {
                return Err(AmqpError::NackMessageError(format!(
                    "unknown delivery tag {delivery_tag}"
                )));
            };

            state.nacks.extend(tags.iter().copied());
            if requeue {
                state.requeue(tags, self.id);
            } else if let Some(ch) = state.channels.get_mut(&self.id) {
                for tag in tags {
                    ch.unacked.remove(&tag);
                }
            }
            state.dispatch()
        };

        deliver(deliveries);
        Ok(())
    }

    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>) {
        let registered = {
            let mut state = self.broker.lock();
            match state.channels.get_mut(&self.id) {
                Some(ch) if ch.open => {
                    ch.shutdown.push(listener.clone());
                    true
                }
                _ => false,
            }
        };

        if !registered {
            listener.on_shutdown(AmqpError::ChannelClosedError(format!(
                "channel {} is closed",
                self.id
            )));
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let (listeners, deliveries) = {
            let mut state = self.broker.lock();
            let listeners = state.close_channel(self.id);
            (listeners, state.dispatch())
        };

        deliver(deliveries);
        for listener in listeners {
            listener.on_shutdown(AmqpError::ChannelClosedError(format!(
                "channel {} closed by client",
                self.id
            )));
        }
        Ok(())
    }
}
