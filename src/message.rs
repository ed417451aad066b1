// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope & Acknowledgement Protocol
//!
//! A `MessageEnvelope` wraps one delivered message together with the channel
//! operations needed to resolve it. Resolution is applied exactly once per
//! delivery tag; the envelope is cheap to clone so a chained continuation can
//! own its copy and resolve it from any task.

use crate::{channel::AckChannel, errors::AmqpError};
use futures_util::future::BoxFuture;
use lapin::{protocol::basic::AMQPProperties, types::FieldTable};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::debug;

/// Outcome a handler returns to tell the engine how to resolve a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Acknowledge the message, removing it permanently.
    Ack,
    /// Reject the message and requeue it on the original queue.
    NackRequeue,
    /// Reject the message without requeue; broker topology routes it to the
    /// dead-letter queue when one is configured.
    NackDeadLetter,
    /// The caller defers resolution, typically to the ordered dispatcher.
    Manual,
}

/// Callback invoked when processing a message fails; delegates to the owning
/// subscriber's error-action policy.
pub type ErrorHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// One delivered message, bound to the channel it arrived on.
#[derive(Clone)]
pub struct MessageEnvelope {
    queue: String,
    consumer_tag: String,
    routing_key: String,
    delivery_tag: u64,
    redelivered: bool,
    properties: AMQPProperties,
    body: Vec<u8>,
    channel: Arc<dyn AckChannel>,
    resolved: Arc<AtomicBool>,
    error_hook: Option<ErrorHook>,
}

impl MessageEnvelope {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: &str,
        consumer_tag: &str,
        routing_key: &str,
        delivery_tag: u64,
        redelivered: bool,
        properties: AMQPProperties,
        body: Vec<u8>,
        channel: Arc<dyn AckChannel>,
        error_hook: Option<ErrorHook>,
    ) -> Self {
        MessageEnvelope {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            routing_key: routing_key.to_owned(),
            delivery_tag,
            redelivered,
            properties,
            body,
            channel,
            resolved: Arc::new(AtomicBool::new(false)),
            error_hook,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Broker-assigned identifier, monotonic per channel.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// True once the broker has delivered this message more than once.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn properties(&self) -> &AMQPProperties {
        &self.properties
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body decoded as UTF-8, replacing invalid sequences.
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Acknowledges the message, removing it from the queue.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.already_resolved() {
            return Ok(());
        }
        self.channel.ack(self.delivery_tag).await
    }

    /// Rejects the message, optionally requeuing it.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.already_resolved() {
            return Ok(());
        }
        self.channel.nack(self.delivery_tag, requeue).await
    }

    /// Applies an acknowledgement decision to this delivery.
    ///
    /// Exactly one broker call is made per delivery tag; a second resolution
    /// is a logged no-op. `Manual` resolves nothing and leaves the envelope
    /// open for whoever deferred it.
    pub async fn resolve(&self, ack: Acknowledgement) -> Result<(), AmqpError> {
        match ack {
            Acknowledgement::Ack => self.ack().await,
            Acknowledgement::NackRequeue => self.nack(true).await,
            Acknowledgement::NackDeadLetter => self.nack(false).await,
            Acknowledgement::Manual => Ok(()),
        }
    }

    /// Runs the configured error-action callback, if any.
    pub(crate) async fn run_error_hook(&self) {
        if let Some(hook) = &self.error_hook {
            hook().await;
        }
    }

    fn already_resolved(&self) -> bool {
        if self.resolved.swap(true, Ordering::SeqCst) {
            debug!(
                delivery_tag = self.delivery_tag,
                queue = self.queue,
                "message already resolved, skipping"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::MockAckChannel;

    pub(crate) fn envelope_with(
        channel: Arc<dyn AckChannel>,
        delivery_tag: u64,
        body: &[u8],
    ) -> MessageEnvelope {
        MessageEnvelope::new(
            "orders",
            "orders-consumer",
            "orders.created",
            delivery_tag,
            false,
            AMQPProperties::default(),
            body.to_vec(),
            channel,
            None,
        )
    }

    #[tokio::test]
    async fn resolve_ack_calls_broker_once() {
        let mut channel = MockAckChannel::new();
        channel.expect_ack().times(1).returning(|_| Ok(()));

        let envelope = envelope_with(Arc::new(channel), 7, b"{}");

        envelope.resolve(Acknowledgement::Ack).await.unwrap();
    }

    #[tokio::test]
    async fn double_resolution_is_a_no_op() {
        let mut channel = MockAckChannel::new();
        channel.expect_ack().times(1).returning(|_| Ok(()));

        let envelope = envelope_with(Arc::new(channel), 7, b"{}");

        envelope.resolve(Acknowledgement::Ack).await.unwrap();
        envelope.resolve(Acknowledgement::NackRequeue).await.unwrap();
    }

    #[tokio::test]
    async fn clones_share_the_resolution_guard() {
        let mut channel = MockAckChannel::new();
        channel.expect_nack().times(1).returning(|_, _| Ok(()));

        let envelope = envelope_with(Arc::new(channel), 9, b"{}");
        let clone = envelope.clone();

        clone.resolve(Acknowledgement::NackRequeue).await.unwrap();
        envelope.resolve(Acknowledgement::Ack).await.unwrap();
    }

    #[tokio::test]
    async fn dead_letter_nacks_without_requeue() {
        let mut channel = MockAckChannel::new();
        channel
            .expect_nack()
            .withf(|_, requeue| !requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let envelope = envelope_with(Arc::new(channel), 3, b"not json");

        envelope.resolve(Acknowledgement::NackDeadLetter).await.unwrap();
    }

    #[tokio::test]
    async fn manual_resolves_nothing() {
        let channel = MockAckChannel::new();

        let envelope = envelope_with(Arc::new(channel), 1, b"{}");

        envelope.resolve(Acknowledgement::Manual).await.unwrap();

        // the envelope is still open for a later decision
        assert!(!envelope.resolved.load(Ordering::SeqCst));
    }
}
