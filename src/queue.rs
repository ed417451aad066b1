// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Descriptors
//!
//! Definition of one consumed queue: identity, prefetch, recovery policy and
//! the optional topology the crate can declare for it. Descriptors are built
//! once, validated by the surrounding application, and are immutable for the
//! life of a subscription.

pub(crate) const DEFAULT_RETRY_INTERVAL_SECS: u64 = 15;
pub(crate) const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 300;

/// What the subscriber does with a message whose processing failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorAction {
    /// Tear the consumer, channel and connection down and restart after the
    /// backoff interval; the failing message is left unresolved and the
    /// broker requeues it.
    #[default]
    RestartConnection,
    /// Requeue the failing message, then pause deliveries for the backoff
    /// interval before resuming on the same subscription.
    NackOnException,
    /// Nack without requeue; broker topology may dead-letter it. No delay is
    /// introduced for subsequent messages.
    DropMessage,
    /// Requeue on first delivery; once the broker reports the message as
    /// redelivered, drop it.
    DropAfterOneRedelivery,
}

/// Definition of a queue subscription with its configuration parameters.
#[derive(Debug, Clone)]
pub struct QueueDescriptor {
    pub(crate) name: String,
    pub(crate) consumer_tag: String,
    handler_tag: Option<String>,
    pub(crate) prefetch_count: u16,
    pub(crate) retry_interval_secs: u64,
    pub(crate) auto_backoff: bool,
    pub(crate) on_error: ErrorAction,
    pub(crate) idle_threshold_secs: u64,
    pub(crate) dlq_name: Option<String>,
    pub(crate) durable: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) exchange: Option<String>,
    pub(crate) routing_key: Option<String>,
}

impl QueueDescriptor {
    /// Creates a descriptor with the given queue name and consumer tag and
    /// conservative defaults: prefetch 1, 15s retry interval, no backoff
    /// growth, restart-connection error handling.
    pub fn new(name: &str, consumer_tag: &str) -> QueueDescriptor {
        QueueDescriptor {
            name: name.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            handler_tag: None,
            prefetch_count: 1,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            auto_backoff: false,
            on_error: ErrorAction::default(),
            idle_threshold_secs: DEFAULT_IDLE_THRESHOLD_SECS,
            dlq_name: None,
            durable: false,
            ttl: None,
            max_length: None,
            exchange: None,
            routing_key: None,
        }
    }

    /// Overrides the tag used to pair this queue with a handler. Defaults to
    /// the consumer tag.
    pub fn handler_tag(mut self, tag: &str) -> Self {
        self.handler_tag = Some(tag.to_owned());
        self
    }

    /// Maximum number of unacknowledged messages delivered on the channel.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Seconds to wait before reattempting to consume after a failure.
    pub fn retry_interval(mut self, secs: u64) -> Self {
        self.retry_interval_secs = secs;
        self
    }

    /// Grows the retry interval with the consecutive-failure count, capped
    /// at the maximum interval.
    pub fn auto_backoff(mut self) -> Self {
        self.auto_backoff = true;
        self
    }

    pub fn on_error(mut self, action: ErrorAction) -> Self {
        self.on_error = action;
        self
    }

    /// Seconds without a delivery before the idle watchdog recycles the
    /// connection.
    pub fn idle_threshold(mut self, secs: u64) -> Self {
        self.idle_threshold_secs = secs;
        self
    }

    /// Adds a dead-letter queue named `<queue>-dlq`.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Routes rejected messages to an explicitly named dead-letter queue.
    pub fn with_dlq_named(mut self, name: &str) -> Self {
        self.dlq_name = Some(name.to_owned());
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Message Time-To-Live in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Binds the queue to an exchange with the given routing key when the
    /// topology is installed.
    pub fn bound_to(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self.routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// The tag handlers are matched against; falls back to the consumer tag
    /// when no explicit handler tag was configured.
    pub fn effective_handler_tag(&self) -> &str {
        self.handler_tag.as_deref().unwrap_or(&self.consumer_tag)
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }
}
