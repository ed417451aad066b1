// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Contracts
//!
//! Pluggable user logic. A `MessageHandler` receives whole envelopes and
//! decides their acknowledgement; an `OrderedHandler` additionally splits a
//! message into a dispatch key and an item so the ordered dispatcher can
//! serialize same-key work.

use crate::message::{Acknowledgement, MessageEnvelope};
use async_trait::async_trait;
use std::{fmt::Debug, hash::Hash};
use thiserror::Error;

/// Failure raised by user processing code.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError(message.to_owned())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError(message)
    }
}

/// A component that can consume messages from a queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Whether this handler accepts messages for the given handler tag,
    /// used to pair handlers with configured queues at startup.
    fn can_process(&self, handler_tag: &str) -> bool;

    /// Consumes one message and returns how it should be resolved.
    ///
    /// Returning `Acknowledgement::Manual` defers resolution to whoever the
    /// handler delegated the envelope to. An `Err` routes the message
    /// through the queue's configured error-action policy.
    async fn process(&self, envelope: &MessageEnvelope) -> Result<Acknowledgement, HandlerError>;
}

/// Result of decoding an envelope ahead of ordered dispatch.
pub enum Decoded<K, V> {
    /// The message decoded; `key` orders it, `item` is handed to processing.
    Accepted { key: K, item: V },
    /// The message could not be decoded; resolve it with this
    /// acknowledgement without consuming an ordering slot.
    Rejected(Acknowledgement),
}

impl<K, V> Decoded<K, V> {
    pub fn accepted(key: K, item: V) -> Self {
        Decoded::Accepted { key, item }
    }

    pub fn rejected(ack: Acknowledgement) -> Self {
        Decoded::Rejected(ack)
    }
}

/// User logic behind the ordered dispatcher.
///
/// `decode` runs on the delivery path and must not block; `process` runs
/// inside the key's chain, one item at a time per key, in arrival order.
#[async_trait]
pub trait OrderedHandler: Send + Sync {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Item: Send + 'static;

    fn can_process(&self, handler_tag: &str) -> bool;

    /// Extracts the dispatch key and the work item from an envelope.
    ///
    /// Malformed messages are reported as `Decoded::Rejected` (commonly
    /// `NackDeadLetter`) rather than errors, so they never block their
    /// key's chain.
    fn decode(&self, envelope: &MessageEnvelope) -> Decoded<Self::Key, Self::Item>;

    /// Processes one decoded item.
    async fn process(&self, item: Self::Item) -> Result<Acknowledgement, HandlerError>;
}
