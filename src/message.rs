// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Value types flowing through the publish and consume pipelines: the outbound
//! message handed to the publish engine, the per-message confirmation result, and
//! the inbound delivery produced by a broker consumer callback.

use crate::{errors::AmqpError, otel};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
        ShortUInt,
    },
    BasicProperties,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    Context,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Content type set by [`OutboundMessage::json`]
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header the broker adds to dead-lettered messages
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Count field of an x-death entry
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Typed header value accepted by [`OutboundMessage::header`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
    Bool(bool),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Uint(v) => AMQPValue::ShortUInt(ShortUInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

/// A message to publish.
///
/// Created by the caller and consumed once by the publish engine. Every message
/// carries a message id; a random one is assigned unless the caller sets one.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) properties: BasicProperties,
    pub(crate) body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> Self {
        OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: BasicProperties::default()
                .with_message_id(ShortString::from(Uuid::new_v4().to_string())),
            body: body.into(),
        }
    }

    /// Serializes `payload` as the JSON body of a new message.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<Self, AmqpError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| AmqpError::PublishError(format!("invalid json payload: {err}")))?;

        let message = Self::new(exchange, routing_key, body);
        let properties = message
            .properties
            .clone()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE));

        Ok(message.properties(properties))
    }

    /// Replaces the message properties, keeping the generated message id when
    /// the new properties carry none.
    pub fn properties(mut self, properties: BasicProperties) -> Self {
        let keep_id = properties.message_id().is_none();
        self.properties = match (keep_id, self.properties.message_id().clone()) {
            (true, Some(id)) => properties.with_message_id(id),
            _ => properties,
        };
        self
    }

    /// Sets the message type property.
    pub fn kind(mut self, kind: &str) -> Self {
        self.properties = self.properties.with_kind(ShortString::from(kind));
        self
    }

    /// Adds a header field.
    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        let mut headers = self
            .properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default();
        headers.insert(ShortString::from(key), AMQPValue::from(value.into()));
        self.properties = self.properties.with_headers(FieldTable::from(headers));
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn basic_properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Properties as written to the wire: the message headers plus the current
    /// OpenTelemetry context.
    pub(crate) fn wire_properties(&self, ctx: &Context) -> BasicProperties {
        let mut headers: BTreeMap<ShortString, AMQPValue> = self
            .properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default();

        otel::inject_context(ctx, &mut headers);

        self.properties
            .clone()
            .with_headers(FieldTable::from(headers))
    }
}

/// Outcome of a confirm-tracked publish.
///
/// Exactly one result is produced for every message handed to the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessageResult {
    pub(crate) message: OutboundMessage,
    pub(crate) ack: bool,
    pub(crate) channel_id: u16,
    pub(crate) sequence_number: u64,
    pub(crate) error: Option<AmqpError>,
}

impl OutboundMessageResult {
    /// True when the broker acknowledged the message.
    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    pub fn into_message(self) -> OutboundMessage {
        self.message
    }

    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Publish sequence number the broker confirmed.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// The cause when the message was failed locally instead of nacked by the
    /// broker, e.g. the channel closed before the confirmation arrived.
    pub fn error(&self) -> Option<&AmqpError> {
        self.error.as_ref()
    }
}

/// A message pushed by the broker to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl InboundDelivery {
    /// Decodes the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.body)
            .map_err(|err| AmqpError::ConsumeError(format!("invalid json payload: {err}")))
    }

    /// Message type property, empty when unset.
    pub fn kind(&self) -> String {
        self.properties
            .kind()
            .as_ref()
            .map(|kind| kind.to_string())
            .unwrap_or_default()
    }

    /// How many times the message was dead-lettered from its latest queue, taken
    /// from the first `x-death` entry. Zero for a first delivery.
    pub fn death_count(&self) -> i64 {
        self.properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(AMQP_HEADERS_X_DEATH))
            .and_then(AMQPValue::as_array)
            .and_then(|deaths| deaths.as_slice().first())
            .and_then(AMQPValue::as_field_table)
            .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
            .and_then(AMQPValue::as_long_long_int)
            .unwrap_or_default()
    }

    /// OpenTelemetry context propagated by the publisher.
    pub fn trace_context(&self) -> Context {
        otel::extract_context(&self.properties)
    }

    /// Starts a consumer span named after the message type, parented on the
    /// propagated context.
    pub fn start_span(&self, tracer: &BoxedTracer) -> (Context, BoxedSpan) {
        let name = match self.kind() {
            kind if kind.is_empty() => self.routing_key.clone(),
            kind => kind,
        };
        otel::new_span(&self.properties, tracer, &name)
    }
}

impl From<lapin::message::Delivery> for InboundDelivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            body: delivery.data,
        }
    }
}
