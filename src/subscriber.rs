// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Subscriber Lifecycle
//!
//! Owns the channel/consumer subscription for one queue: a state machine
//! with retry/backoff, configurable error-action policies and an
//! idle-connection watchdog. Deliveries are wrapped as envelopes and routed
//! to the bound handler; the handler's failures come back through the
//! envelope's error hook into the policy configured on the queue.

use crate::{
    channel::{self, AckChannel},
    config::AmqpConfig,
    consumer::process_delivery,
    errors::AmqpError,
    handler::MessageHandler,
    message::{ErrorHook, MessageEnvelope},
    queue::{ErrorAction, QueueDescriptor},
};
use futures_util::{FutureExt, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection, Consumer,
};
use opentelemetry::global;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::{task::JoinHandle, time};
use tracing::{debug, error, info, warn};

pub(crate) const MAX_RETRY_INTERVAL_SECS: u64 = 120;
const WATCHDOG_TICK_SECS: u64 = 30;

/// Lifecycle of one queue subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Stopped,
    Starting,
    Consuming,
    ErrorBackoff,
    Closed,
}

/// Retry interval for the current consecutive-failure count, capped at the
/// maximum. Without auto-backoff the base interval is used as-is.
pub(crate) fn backoff_interval(base_secs: u64, auto_backoff: bool, failures: u32) -> Duration {
    let factor = if auto_backoff {
        u64::from(failures.max(1))
    } else {
        1
    };
    Duration::from_secs(base_secs.saturating_mul(factor).min(MAX_RETRY_INTERVAL_SECS))
}

/// What the lifecycle manager does after a policy has dealt with the
/// failing message itself.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ErrorDisposition {
    /// The message was resolved; carry on consuming.
    Resolved,
    /// The message was requeued; hold deliveries for this long.
    Pause(Duration),
    /// Tear down and restart the subscription; the message stays
    /// unresolved and the broker requeues it.
    Restart,
}

/// Applies one error-action policy to a failed delivery.
pub(crate) async fn apply_error_action(
    action: ErrorAction,
    channel: &dyn AckChannel,
    delivery_tag: u64,
    redelivered: bool,
    pause: Duration,
) -> ErrorDisposition {
    match action {
        ErrorAction::DropMessage => {
            if let Err(err) = channel.nack(delivery_tag, false).await {
                error!(error = err.to_string(), delivery_tag, "error whiling dropping msg");
            }
            info!(delivery_tag, "dropped message");
            ErrorDisposition::Resolved
        }
        ErrorAction::DropAfterOneRedelivery => {
            // one requeue is granted; a redelivered failure is dropped
            let requeue = !redelivered;
            if let Err(err) = channel.nack(delivery_tag, requeue).await {
                error!(error = err.to_string(), delivery_tag, "error whiling nacking msg");
            }
            ErrorDisposition::Resolved
        }
        ErrorAction::NackOnException => {
            if !channel.is_open() {
                return ErrorDisposition::Restart;
            }
            if let Err(err) = channel.nack(delivery_tag, true).await {
                error!(error = err.to_string(), delivery_tag, "error whiling requeuing msg");
            }
            ErrorDisposition::Pause(pause)
        }
        ErrorAction::RestartConnection => ErrorDisposition::Restart,
    }
}

#[derive(Default)]
struct Link {
    connection: Option<Arc<Connection>>,
    channel: Option<Arc<Channel>>,
}

struct SubscriberCore {
    config: AmqpConfig,
    descriptor: QueueDescriptor,
    handler: Arc<dyn MessageHandler>,
    state: Mutex<SubscriberState>,
    link: tokio::sync::Mutex<Link>,
    retry_count: AtomicU32,
    restart_armed: AtomicBool,
    last_delivery: Mutex<Instant>,
    watchdog_gate: Mutex<()>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

/// Consumes one queue with the resilience behavior its descriptor asks for.
pub struct QueueSubscriber {
    core: Arc<SubscriberCore>,
}

impl QueueSubscriber {
    pub fn new(
        config: AmqpConfig,
        descriptor: QueueDescriptor,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        QueueSubscriber {
            core: Arc::new(SubscriberCore {
                config,
                descriptor,
                handler,
                state: Mutex::new(SubscriberState::Stopped),
                link: tokio::sync::Mutex::new(Link::default()),
                retry_count: AtomicU32::new(0),
                restart_armed: AtomicBool::new(false),
                last_delivery: Mutex::new(Instant::now()),
                watchdog_gate: Mutex::new(()),
                watchdog: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SubscriberState {
        self.core.state()
    }

    /// Opens the channel, applies QoS and registers the consumer.
    ///
    /// Missing configuration is fatal and surfaces immediately. A transport
    /// failure is not: it transitions to `ErrorBackoff` and arms the retry
    /// timer.
    pub async fn start(&self) -> Result<(), AmqpError> {
        if self.core.state() == SubscriberState::Closed {
            return Err(AmqpError::ClosedError);
        }
        self.core.config.validate()?;

        self.spawn_watchdog();
        Arc::clone(&self.core).start_queue().await;
        Ok(())
    }

    /// Stops consuming: cancels the consumer, closes channel then
    /// connection. Idempotent; a pending restart timer observes the state
    /// change and dies. In-flight processing is not cancelled.
    pub async fn stop(&self) {
        self.core.set_state(SubscriberState::Stopped);
        self.core.teardown().await;
    }

    /// Terminal disposal: also stops the watchdog. Subsequent `start` calls
    /// are rejected.
    pub async fn close(&self) {
        if let Some(watchdog) = self.core.watchdog.lock().unwrap().take() {
            watchdog.abort();
        }
        self.core.set_state(SubscriberState::Closed);
        self.core.teardown().await;
    }

    fn spawn_watchdog(&self) {
        let weak = Arc::downgrade(&self.core);
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(WATCHDOG_TICK_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(core) = weak.upgrade() else { return };
                core.watchdog_tick();
            }
        });

        if let Some(old) = self.core.watchdog.lock().unwrap().replace(handle) {
            old.abort();
        }
    }
}

impl SubscriberCore {
    fn state(&self) -> SubscriberState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: SubscriberState) {
        let mut state = self.state.lock().unwrap();
        if *state == SubscriberState::Closed {
            return;
        }
        *state = next;
    }

    async fn start_queue(self: Arc<Self>) {
        self.set_state(SubscriberState::Starting);

        match self.open_consumer().await {
            Ok((consumer, channel)) => {
                *self.last_delivery.lock().unwrap() = Instant::now();
                self.set_state(SubscriberState::Consuming);
                self.spawn_pump(consumer, channel);
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.descriptor.name,
                    "failure to start consuming"
                );
                self.retry_count.fetch_add(1, Ordering::SeqCst);
                self.schedule_restart();
            }
        }
    }

    async fn open_consumer(&self) -> Result<(Consumer, Arc<Channel>), AmqpError> {
        // drop whatever is left of a previous session first
        self.teardown().await;

        let (connection, channel) = channel::new_amqp_channel(&self.config).await?;

        if let Err(err) = channel
            .basic_qos(self.descriptor.prefetch_count, BasicQosOptions::default())
            .await
        {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(self.descriptor.name.clone()));
        }

        let consumer = match channel
            .basic_consume(
                &self.descriptor.name,
                &self.descriptor.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                return Err(AmqpError::BindingConsumerError(
                    self.descriptor.consumer_tag.clone(),
                ));
            }
        };

        let mut link = self.link.lock().await;
        link.connection = Some(connection);
        link.channel = Some(Arc::clone(&channel));

        Ok((consumer, channel))
    }

    fn spawn_pump(self: Arc<Self>, mut consumer: Consumer, channel: Arc<Channel>) {
        tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        *self.last_delivery.lock().unwrap() = Instant::now();
                        let envelope = Arc::clone(&self).wrap(delivery, Arc::clone(&channel));
                        if process_delivery(&tracer, &envelope, &self.handler).await {
                            self.retry_count.store(0, Ordering::SeqCst);
                        }
                    }
                    Err(err) => {
                        error!(
                            error = err.to_string(),
                            queue = self.descriptor.name,
                            "errors consume msg"
                        );
                        self.retry_count.fetch_add(1, Ordering::SeqCst);
                        Arc::clone(&self).schedule_restart();
                        break;
                    }
                }
            }

            debug!(queue = self.descriptor.name, "delivery stream ended");
        });
    }

    /// Wraps one delivery as an envelope whose error hook routes back into
    /// this subscriber's error-action policy.
    fn wrap(self: Arc<Self>, delivery: Delivery, channel: Arc<Channel>) -> MessageEnvelope {
        let delivery_tag = delivery.delivery_tag;
        let redelivered = delivery.redelivered;

        let hook_core = Arc::clone(&self);
        let hook_channel = Arc::clone(&channel);
        let hook: ErrorHook = Arc::new(move || {
            let core = Arc::clone(&hook_core);
            let channel = Arc::clone(&hook_channel);
            async move {
                core.on_processing_error(channel, delivery_tag, redelivered)
                    .await
            }
            .boxed()
        });

        MessageEnvelope::new(
            &self.descriptor.name,
            &self.descriptor.consumer_tag,
            delivery.routing_key.as_str(),
            delivery_tag,
            redelivered,
            delivery.properties,
            delivery.data,
            channel,
            Some(hook),
        )
    }

    async fn on_processing_error(
        self: Arc<Self>,
        channel: Arc<Channel>,
        delivery_tag: u64,
        redelivered: bool,
    ) {
        let failures = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        let pause = backoff_interval(
            self.descriptor.retry_interval_secs,
            self.descriptor.auto_backoff,
            failures,
        );

        let disposition = apply_error_action(
            self.descriptor.on_error,
            channel.as_ref(),
            delivery_tag,
            redelivered,
            pause,
        )
        .await;

        match disposition {
            ErrorDisposition::Resolved => {}
            ErrorDisposition::Pause(interval) => {
                // the pump awaits this hook, so the whole channel pauses
                // until the interval elapses
                info!(
                    queue = self.descriptor.name,
                    secs = interval.as_secs(),
                    attempt = failures,
                    "pausing queue processing"
                );
                time::sleep(interval).await;
            }
            ErrorDisposition::Restart => self.schedule_restart(),
        }
    }

    /// Arms the single restart timer. Concurrent failure reports collapse
    /// into one scheduled restart through the armed flag.
    fn schedule_restart(self: Arc<Self>) {
        if self
            .restart_armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let failures = self.retry_count.load(Ordering::SeqCst).max(1);
        let delay = backoff_interval(
            self.descriptor.retry_interval_secs,
            self.descriptor.auto_backoff,
            failures,
        );
        self.set_state(SubscriberState::ErrorBackoff);
        info!(
            queue = self.descriptor.name,
            secs = delay.as_secs(),
            attempt = failures,
            "restarting queue connection"
        );

        tokio::spawn(async move {
            self.teardown().await;
            time::sleep(delay).await;
            self.restart_armed.store(false, Ordering::SeqCst);
            if self.state() != SubscriberState::ErrorBackoff {
                // stopped or closed while the timer was pending
                return;
            }
            self.start_queue().await;
        });
    }

    async fn teardown(&self) {
        let (channel, connection) = {
            let mut link = self.link.lock().await;
            (link.channel.take(), link.connection.take())
        };

        if let Some(channel) = channel {
            // cancel first so accepted deliveries drain rather than being
            // cut off mid-processing
            if let Err(err) = channel
                .basic_cancel(&self.descriptor.consumer_tag, BasicCancelOptions::default())
                .await
            {
                debug!(error = err.to_string(), "error whiling cancelling consumer");
            }
            if let Err(err) = channel.close(200, "recycling").await {
                debug!(error = err.to_string(), "error whiling closing channel");
            }
        }

        if let Some(connection) = connection {
            if let Err(err) = connection.close(200, "recycling").await {
                debug!(error = err.to_string(), "error whiling closing connection");
            }
        }
    }

    /// One idle check. The non-blocking gate makes overlapping ticks
    /// harmless; the restart CAS collapses this with error-path restarts.
    fn watchdog_tick(self: Arc<Self>) {
        let Ok(_gate) = self.watchdog_gate.try_lock() else {
            return;
        };

        if self.state() != SubscriberState::Consuming {
            return;
        }

        let idle = self.last_delivery.lock().unwrap().elapsed();
        if idle < Duration::from_secs(self.descriptor.idle_threshold_secs) {
            return;
        }

        warn!(
            queue = self.descriptor.name,
            idle_secs = idle.as_secs(),
            "idle connection detected, recycling"
        );
        *self.last_delivery.lock().unwrap() = Instant::now();
        self.clone().schedule_restart();
    }
}

/// Pairs each configured queue with the first handler accepting its handler
/// tag. A queue without a handler is a fatal startup error, raised
/// immediately rather than retried.
pub fn bind_handlers(
    config: &AmqpConfig,
    descriptors: Vec<QueueDescriptor>,
    handlers: &[Arc<dyn MessageHandler>],
) -> Result<Vec<QueueSubscriber>, AmqpError> {
    descriptors
        .into_iter()
        .map(|descriptor| {
            let handler = handlers
                .iter()
                .find(|handler| handler.can_process(descriptor.effective_handler_tag()))
                .ok_or_else(|| AmqpError::MissingHandlerError(descriptor.name().to_owned()))?;

            Ok(QueueSubscriber::new(
                config.clone(),
                descriptor,
                Arc::clone(handler),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAckChannel;
    use crate::handler::HandlerError;
    use crate::message::Acknowledgement;
    use async_trait::async_trait;

    struct TaggedHandler {
        tag: &'static str,
    }

    #[async_trait]
    impl MessageHandler for TaggedHandler {
        fn can_process(&self, handler_tag: &str) -> bool {
            handler_tag == self.tag
        }

        async fn process(
            &self,
            _envelope: &MessageEnvelope,
        ) -> Result<Acknowledgement, HandlerError> {
            Ok(Acknowledgement::Ack)
        }
    }

    fn test_subscriber(descriptor: QueueDescriptor) -> QueueSubscriber {
        QueueSubscriber::new(
            AmqpConfig::new("localhost", "guest", "guest"),
            descriptor,
            Arc::new(TaggedHandler { tag: "orders-consumer" }),
        )
    }

    #[test]
    fn backoff_uses_base_interval_without_auto_backoff() {
        assert_eq!(backoff_interval(15, false, 5), Duration::from_secs(15));
    }

    #[test]
    fn backoff_grows_with_consecutive_failures() {
        assert_eq!(backoff_interval(15, true, 1), Duration::from_secs(15));
        assert_eq!(backoff_interval(15, true, 3), Duration::from_secs(45));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(
            backoff_interval(15, true, 100),
            Duration::from_secs(MAX_RETRY_INTERVAL_SECS)
        );
    }

    #[tokio::test]
    async fn drop_message_nacks_without_requeue_and_resumes() {
        let mut channel = MockAckChannel::new();
        channel
            .expect_nack()
            .withf(|_, requeue| !requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let disposition = apply_error_action(
            ErrorAction::DropMessage,
            &channel,
            1,
            false,
            Duration::from_secs(15),
        )
        .await;

        assert_eq!(disposition, ErrorDisposition::Resolved);
    }

    #[tokio::test]
    async fn drop_after_one_redelivery_requeues_first_delivery() {
        let mut channel = MockAckChannel::new();
        channel
            .expect_nack()
            .withf(|_, requeue| *requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let disposition = apply_error_action(
            ErrorAction::DropAfterOneRedelivery,
            &channel,
            1,
            false,
            Duration::from_secs(15),
        )
        .await;

        assert_eq!(disposition, ErrorDisposition::Resolved);
    }

    #[tokio::test]
    async fn drop_after_one_redelivery_drops_redelivered_message() {
        let mut channel = MockAckChannel::new();
        channel
            .expect_nack()
            .withf(|_, requeue| !requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let disposition = apply_error_action(
            ErrorAction::DropAfterOneRedelivery,
            &channel,
            1,
            true,
            Duration::from_secs(15),
        )
        .await;

        assert_eq!(disposition, ErrorDisposition::Resolved);
    }

    #[tokio::test]
    async fn nack_on_exception_requeues_and_pauses() {
        let mut channel = MockAckChannel::new();
        channel.expect_is_open().return_const(true);
        channel
            .expect_nack()
            .withf(|_, requeue| *requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let disposition = apply_error_action(
            ErrorAction::NackOnException,
            &channel,
            1,
            false,
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(disposition, ErrorDisposition::Pause(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn nack_on_exception_restarts_when_channel_is_gone() {
        let mut channel = MockAckChannel::new();
        channel.expect_is_open().return_const(false);

        let disposition = apply_error_action(
            ErrorAction::NackOnException,
            &channel,
            1,
            false,
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(disposition, ErrorDisposition::Restart);
    }

    #[tokio::test]
    async fn restart_connection_leaves_the_message_unresolved() {
        // no ack/nack expectations: any channel call would fail the test
        let channel = MockAckChannel::new();

        let disposition = apply_error_action(
            ErrorAction::RestartConnection,
            &channel,
            1,
            false,
            Duration::from_secs(15),
        )
        .await;

        assert_eq!(disposition, ErrorDisposition::Restart);
    }

    #[tokio::test]
    async fn concurrent_failure_reports_arm_a_single_restart() {
        let subscriber = test_subscriber(
            QueueDescriptor::new("orders", "orders-consumer").retry_interval(60),
        );
        let core = Arc::clone(&subscriber.core);

        Arc::clone(&core).schedule_restart();
        Arc::clone(&core).schedule_restart();
        Arc::clone(&core).schedule_restart();

        assert!(core.restart_armed.load(Ordering::SeqCst));
        assert_eq!(core.state(), SubscriberState::ErrorBackoff);
    }

    #[tokio::test]
    async fn stop_twice_is_a_no_op() {
        let subscriber =
            test_subscriber(QueueDescriptor::new("orders", "orders-consumer"));

        subscriber.stop().await;
        subscriber.stop().await;

        assert_eq!(subscriber.state(), SubscriberState::Stopped);
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let subscriber =
            test_subscriber(QueueDescriptor::new("orders", "orders-consumer"));

        subscriber.close().await;
        subscriber.close().await;
        assert_eq!(subscriber.state(), SubscriberState::Closed);

        // a closed subscriber refuses to start again
        assert_eq!(subscriber.start().await, Err(AmqpError::ClosedError));

        subscriber.stop().await;
        assert_eq!(subscriber.state(), SubscriberState::Closed);
    }

    #[tokio::test]
    async fn watchdog_ignores_a_subscriber_that_is_not_consuming() {
        let subscriber = test_subscriber(
            QueueDescriptor::new("orders", "orders-consumer").retry_interval(60),
        );
        let core = Arc::clone(&subscriber.core);

        Arc::clone(&core).watchdog_tick();

        assert!(!core.restart_armed.load(Ordering::SeqCst));
        assert_eq!(core.state(), SubscriberState::Stopped);
    }

    #[tokio::test]
    async fn watchdog_recycles_an_idle_consuming_connection() {
        let subscriber = test_subscriber(
            QueueDescriptor::new("orders", "orders-consumer")
                .retry_interval(60)
                .idle_threshold(300),
        );
        let core = Arc::clone(&subscriber.core);
        core.set_state(SubscriberState::Consuming);

        let Some(past) = Instant::now().checked_sub(Duration::from_secs(400)) else {
            // not enough clock history on this host to fake idleness
            return;
        };
        *core.last_delivery.lock().unwrap() = past;

        Arc::clone(&core).watchdog_tick();

        assert!(core.restart_armed.load(Ordering::SeqCst));
        assert_eq!(core.state(), SubscriberState::ErrorBackoff);
    }

    #[tokio::test]
    async fn watchdog_leaves_a_fresh_connection_alone() {
        let subscriber = test_subscriber(
            QueueDescriptor::new("orders", "orders-consumer").idle_threshold(300),
        );
        let core = Arc::clone(&subscriber.core);
        core.set_state(SubscriberState::Consuming);

        Arc::clone(&core).watchdog_tick();

        assert!(!core.restart_armed.load(Ordering::SeqCst));
        assert_eq!(core.state(), SubscriberState::Consuming);
    }

    #[test]
    fn binding_pairs_queues_with_their_handlers() {
        let config = AmqpConfig::new("localhost", "guest", "guest");
        let handlers: Vec<Arc<dyn MessageHandler>> = vec![
            Arc::new(TaggedHandler { tag: "orders-consumer" }),
            Arc::new(TaggedHandler { tag: "billing-consumer" }),
        ];

        let subscribers = bind_handlers(
            &config,
            vec![
                QueueDescriptor::new("orders", "orders-consumer"),
                QueueDescriptor::new("billing", "billing-consumer"),
            ],
            &handlers,
        )
        .unwrap();

        assert_eq!(subscribers.len(), 2);
        assert!(subscribers[0].core.handler.can_process("orders-consumer"));
        assert!(subscribers[1].core.handler.can_process("billing-consumer"));
    }

    #[test]
    fn binding_fails_fast_when_a_queue_has_no_handler() {
        let config = AmqpConfig::new("localhost", "guest", "guest");
        let handlers: Vec<Arc<dyn MessageHandler>> =
            vec![Arc::new(TaggedHandler { tag: "orders-consumer" })];

        let result = bind_handlers(
            &config,
            vec![QueueDescriptor::new("billing", "billing-consumer")],
            &handlers,
        );

        assert_eq!(
            result.err(),
            Some(AmqpError::MissingHandlerError("billing".to_owned()))
        );
    }
}
