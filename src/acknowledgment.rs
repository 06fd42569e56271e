// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgment Modes
//!
//! The three consumer acknowledgment policies differ only in how the broker consumer
//! is registered and when the broker ack primitive is called:
//!
//! - [`AckMode::None`]: the broker auto-acknowledges on send; a message is gone as soon
//!   as it leaves the broker, even if the caller never processes it.
//! - [`AckMode::Auto`]: manual acknowledgment on the broker side, but every delivery is
//!   acked fire-and-forget right after it is handed downstream. The ack is not awaited
//!   and does not depend on the caller's processing; a caller that fails after
//!   receiving the delivery has lost that message. Cancelling the consumer waits for these
//!   acks before closing its channel, so a handed-off delivery is never requeued.
//! - [`AckMode::Manual`]: deliveries are wrapped in [`AcknowledgeableDelivery`] and only
//!   the caller acknowledges. Unacknowledged deliveries count against the prefetch
//!   window and are redelivered once the consumer channel closes.

use crate::{client::AmqpChannel, errors::AmqpError, message::InboundDelivery};
use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Acknowledgment policy selected when a consumer is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    None,
    Auto,
    Manual,
}

impl AckMode {
    /// Whether the broker consumer is registered in auto-acknowledge mode.
    pub(crate) fn broker_auto_ack(self) -> bool {
        matches!(self, AckMode::None)
    }

    /// Whether a prefetch window applies to the consumer channel.
    pub(crate) fn uses_prefetch(self) -> bool {
        !self.broker_auto_ack()
    }

    /// Runs the policy for a delivery leaving the bridge towards the caller.
    ///
    /// # Returns
    ///
    /// The spawned ack in [`AckMode::Auto`]. The caller never waits on it for the
    /// delivery itself, only before closing the consumer channel.
    pub(crate) fn on_handoff(
        self,
        delivery_tag: u64,
        channel: &Arc<dyn AmqpChannel>,
    ) -> Option<JoinHandle<()>> {
        if self != AckMode::Auto {
            return None;
        }

        let channel = channel.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = channel.ack(delivery_tag, false).await {
                warn!(error = err.to_string(), delivery_tag, "failure to auto-ack delivery");
            }
        }))
    }
}

/// Item type produced by a consumer stream.
pub trait Delivered: Sized + Send + 'static {
    /// The acknowledgment modes able to produce this item type.
    fn accepts(mode: AckMode) -> bool;

    fn wrap(delivery: InboundDelivery, channel: &Arc<dyn AmqpChannel>) -> Self;
}

impl Delivered for InboundDelivery {
    fn accepts(mode: AckMode) -> bool {
        mode != AckMode::Manual
    }

    fn wrap(delivery: InboundDelivery, _channel: &Arc<dyn AmqpChannel>) -> Self {
        delivery
    }
}

impl Delivered for AcknowledgeableDelivery {
    fn accepts(mode: AckMode) -> bool {
        mode == AckMode::Manual
    }

    fn wrap(delivery: InboundDelivery, channel: &Arc<dyn AmqpChannel>) -> Self {
        AcknowledgeableDelivery {
            delivery,
            channel: channel.clone(),
            settled: AtomicBool::new(false),
        }
    }
}

/// A delivery the caller must acknowledge.
///
/// Acknowledgment is one-shot: the first `ack`/`nack` goes to the broker, every later
/// call on the same delivery is a no-op returning `Ok(())`. Calls made after the
/// consumer channel closed fail with [`AmqpError::AckMessageError`] or
/// [`AmqpError::NackMessageError`]; the broker redelivers such messages elsewhere.
pub struct AcknowledgeableDelivery {
    delivery: InboundDelivery,
    channel: Arc<dyn AmqpChannel>,
    settled: AtomicBool,
}

impl AcknowledgeableDelivery {
    /// Acknowledges this delivery, and with `multiple` every earlier
    /// unacknowledged delivery of the same channel.
    pub async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        if !self.channel.is_open() {
            return Err(AmqpError::AckMessageError(format!(
                "channel {} closed before delivery {} was acked",
                self.channel.id(),
                self.delivery.delivery_tag
            )));
        }
        if self.settled.swap(true, Ordering::SeqCst) {
            debug!(delivery_tag = self.delivery.delivery_tag, "delivery already settled");
            return Ok(());
        }

        self.channel.ack(self.delivery.delivery_tag, multiple).await
    }

    /// Rejects this delivery (and earlier ones with `multiple`), optionally
    /// putting it back on the queue.
    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        if !self.channel.is_open() {
            return Err(AmqpError::NackMessageError(format!(
                "channel {} closed before delivery {} was nacked",
                self.channel.id(),
                self.delivery.delivery_tag
            )));
        }
        if self.settled.swap(true, Ordering::SeqCst) {
            debug!(delivery_tag = self.delivery.delivery_tag, "delivery already settled");
            return Ok(());
        }

        self.channel
            .nack(self.delivery.delivery_tag, multiple, requeue)
            .await
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub fn delivery(&self) -> &InboundDelivery {
        &self.delivery
    }

    pub fn into_delivery(self) -> InboundDelivery {
        self.delivery
    }
}

impl Deref for AcknowledgeableDelivery {
    type Target = InboundDelivery;

    fn deref(&self) -> &InboundDelivery {
        &self.delivery
    }
}

impl fmt::Debug for AcknowledgeableDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcknowledgeableDelivery")
            .field("delivery", &self.delivery)
            .field("channel", &self.channel.id())
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::AmqpConnection,
        connection::ConnectionManager,
        consumer::{ConsumeOptions, ConsumerStream},
        fake::FakeBroker,
    };
    use futures_util::StreamExt;
    use std::time::Duration;

    fn manual(broker: &FakeBroker, prefetch: u16) -> ConsumerStream<AcknowledgeableDelivery> {
        let connections = Arc::new(ConnectionManager::new(broker.connector()));
        ConsumerStream::new(
            connections,
            "jobs",
            AckMode::Manual,
            ConsumeOptions::new().prefetch(prefetch),
        )
    }

    async fn next(stream: &mut ConsumerStream<AcknowledgeableDelivery>) -> AcknowledgeableDelivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn only_the_first_settlement_reaches_the_broker() {
        let broker = FakeBroker::new();
        broker.enqueue("jobs", &[b"1".as_slice()]);
        let mut stream = manual(&broker, 10);

        let delivery = next(&mut stream).await;
        assert!(!delivery.is_settled());
        delivery.ack(false).await.unwrap();
        assert!(delivery.is_settled());

        delivery.ack(false).await.unwrap();
        delivery.nack(false, true).await.unwrap();

        assert_eq!(broker.acks(), vec![delivery.delivery_tag]);
        assert!(broker.nacks().is_empty());
        assert_eq!(broker.queue_depth("jobs"), 0);
    }

    #[tokio::test]
    async fn multiple_ack_covers_earlier_deliveries() {
        let broker = FakeBroker::new();
        broker.enqueue("jobs", &[b"1".as_slice(), b"2".as_slice(), b"3".as_slice()]);
        let mut stream = manual(&broker, 3);

        let _first = next(&mut stream).await;
        let _second = next(&mut stream).await;
        let third = next(&mut stream).await;
        third.ack(true).await.unwrap();

        assert_eq!(broker.acks(), vec![1, 2, 3]);
        stream.cancel().await.unwrap();
        // nothing was left unacked to requeue
        assert_eq!(broker.queue_depth("jobs"), 0);
    }

    #[tokio::test]
    async fn requeued_nack_is_redelivered() {
        let broker = FakeBroker::new();
        broker.enqueue("jobs", &[b"1".as_slice()]);
        let mut stream = manual(&broker, 1);

        let delivery = next(&mut stream).await;
        assert!(!delivery.redelivered);
        delivery.nack(false, true).await.unwrap();

        let again = next(&mut stream).await;
        assert_eq!(again.body, b"1");
        assert!(again.redelivered);
        assert_eq!(broker.nacks(), vec![delivery.delivery_tag]);
        assert!(broker.acks().is_empty());
    }

    #[tokio::test]
    async fn nack_without_requeue_discards_the_message() {
        let broker = FakeBroker::new();
        broker.enqueue("jobs", &[b"1".as_slice(), b"2".as_slice()]);
        let mut stream = manual(&broker, 1);

        let delivery = next(&mut stream).await;
        delivery.nack(false, false).await.unwrap();

        assert_eq!(next(&mut stream).await.body, b"2");
        stream.cancel().await.unwrap();

        assert_eq!(broker.nacks(), vec![delivery.delivery_tag]);
        // only the unacked "2" went back
        assert_eq!(broker.queue_depth("jobs"), 1);
    }

    #[tokio::test]
    async fn nack_after_channel_closure_fails() {
        let broker = FakeBroker::new();
        broker.enqueue("jobs", &[b"1".as_slice()]);
        let mut stream = manual(&broker, 1);

        let delivery = next(&mut stream).await;
        broker.kill_consumer_channel("jobs");

        assert!(matches!(
            delivery.nack(false, true).await,
            Err(AmqpError::NackMessageError(_))
        ));
        assert!(!delivery.is_settled());
        assert!(broker.nacks().is_empty());
    }

    #[tokio::test]
    async fn only_auto_mode_acks_on_handoff() {
        let broker = FakeBroker::new();
        let channel = broker.connection().open_channel().await.unwrap();

        assert!(AckMode::None.on_handoff(1, &channel).is_none());
        assert!(AckMode::Manual.on_handoff(1, &channel).is_none());
        assert!(AckMode::Auto.on_handoff(1, &channel).is_some());
    }
}
