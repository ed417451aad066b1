// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Confirmed publishing to RabbitMQ exchanges. A `Publisher` connects
//! lazily, serializes publish-plus-confirmation behind one lock (concurrent
//! publishing on a single channel is unsafe), and recycles its connection
//! after a configurable idle period. The `PublisherPool` memoizes one
//! publisher per named configuration and evicts on hot-reload.

use crate::{channel::new_amqp_channel, config::AmqpConfig, errors::AmqpError, otel};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::{task::JoinHandle, time};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Default)]
struct PublisherLink {
    connection: Option<Arc<Connection>>,
    channel: Option<Arc<Channel>>,
}

async fn clear_link(link: &mut PublisherLink) {
    if let Some(channel) = link.channel.take() {
        if let Err(err) = channel.close(200, "recycling").await {
            debug!(error = err.to_string(), "error whiling closing publish channel");
        }
    }
    if let Some(connection) = link.connection.take() {
        if let Err(err) = connection.close(200, "recycling").await {
            debug!(error = err.to_string(), "error whiling closing publish connection");
        }
    }
}

/// A lazily connected, confirm-publishing connection wrapper.
pub struct Publisher {
    config: AmqpConfig,
    link: tokio::sync::Mutex<PublisherLink>,
    last_publish: Mutex<Instant>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Publisher {
    /// Creates a publisher and arms its idle watchdog. Must be called from
    /// within a tokio runtime; no connection is opened until the first
    /// publish.
    pub fn new(config: AmqpConfig) -> Arc<Publisher> {
        let publisher = Arc::new(Publisher {
            config,
            link: tokio::sync::Mutex::new(PublisherLink::default()),
            last_publish: Mutex::new(Instant::now()),
            watchdog: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        Publisher::spawn_watchdog(&publisher);
        publisher
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.publish_with_properties(exchange, routing_key, payload, BasicProperties::default())
            .await
    }

    /// Serializes the payload as JSON and publishes it with the JSON
    /// content type.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        let data = match serde_json::to_vec(payload) {
            Ok(data) => data,
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize payload");
                return Err(AmqpError::ParsePayloadError);
            }
        };

        self.publish_with_properties(
            exchange,
            routing_key,
            &data,
            BasicProperties::default().with_content_type(ShortString::from(JSON_CONTENT_TYPE)),
        )
        .await
    }

    /// Publishes and waits for the broker's confirmation.
    ///
    /// The current trace context is injected into the message headers and a
    /// fresh message id is assigned. The internal lock spans the publish and
    /// the confirmation wait.
    pub async fn publish_with_properties(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        if exchange.is_empty() && routing_key.is_empty() {
            return Err(AmqpError::MissingRouteError);
        }

        *self.last_publish.lock().unwrap() = Instant::now();

        let mut headers = properties
            .headers()
            .clone()
            .unwrap_or_default()
            .inner()
            .clone();
        otel::inject_publish_context(&Context::current(), &mut headers);

        let properties = properties
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        let mut link = self.link.lock().await;
        let channel = self.ensure_channel(&mut link).await?;

        let confirm = match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishingError);
            }
        };

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                error!(exchange, routing_key, "publish was nacked by the broker");
                Err(AmqpError::PublishConfirmationError)
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publish confirmation");
                Err(AmqpError::PublishConfirmationError)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Disposes the publisher: stops the watchdog and closes channel then
    /// connection. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(watchdog) = self.watchdog.lock().unwrap().take() {
            watchdog.abort();
        }
        let mut link = self.link.lock().await;
        clear_link(&mut link).await;
    }

    async fn ensure_channel(
        &self,
        link: &mut PublisherLink,
    ) -> Result<Arc<Channel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ClosedError);
        }

        if let Some(channel) = &link.channel {
            if channel.status().connected() {
                return Ok(Arc::clone(channel));
            }
        }

        let (connection, channel) = new_amqp_channel(&self.config).await?;

        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(AmqpError::ChannelError);
        }

        link.connection = Some(connection);
        link.channel = Some(Arc::clone(&channel));
        Ok(channel)
    }

    fn spawn_watchdog(publisher: &Arc<Publisher>) {
        let weak = Arc::downgrade(publisher);
        let period = Duration::from_secs(publisher.config.inactivity_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(publisher) = weak.upgrade() else { return };
                if publisher.is_closed() {
                    return;
                }
                publisher.watchdog_sweep().await;
            }
        });

        *publisher.watchdog.lock().unwrap() = Some(handle);
    }

    /// Clears the connection once it has sat idle for the configured
    /// period. The try-acquire means an in-flight publish is never
    /// interrupted and overlapping ticks collapse.
    async fn watchdog_sweep(&self) {
        let Ok(mut link) = self.link.try_lock() else {
            return;
        };

        if link.channel.is_none() {
            return;
        }

        let idle = self.last_publish.lock().unwrap().elapsed();
        if idle < Duration::from_secs(self.config.inactivity_secs) {
            return;
        }

        info!(idle_secs = idle.as_secs(), "idle publishing connection detected, clearing connection");
        clear_link(&mut link).await;
    }
}

#[derive(Default)]
struct PoolState {
    configs: HashMap<String, AmqpConfig>,
    publishers: HashMap<String, Arc<Publisher>>,
}

/// Lazily creates and memoizes one publisher per named configuration.
///
/// A configuration hot-reload for a name evicts and disposes the current
/// instance; the next request builds a fresh one with the new settings.
pub struct PublisherPool {
    state: Mutex<PoolState>,
}

impl PublisherPool {
    pub fn new(configs: HashMap<String, AmqpConfig>) -> PublisherPool {
        PublisherPool {
            state: Mutex::new(PoolState {
                configs,
                publishers: HashMap::default(),
            }),
        }
    }

    /// Returns the publisher for `name`, creating it on first access.
    ///
    /// Atomic under concurrent first access: the state lock guarantees a
    /// single instance per name.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Publisher>, AmqpError> {
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state.publishers.get(name) {
            return Ok(Arc::clone(existing));
        }

        let config = state
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::MissingConfigurationError(name.to_owned()))?;
        config.validate()?;

        debug!(name, "creating publisher");
        let publisher = Publisher::new(config);
        state
            .publishers
            .insert(name.to_owned(), Arc::clone(&publisher));

        Ok(publisher)
    }

    /// Swaps the stored configuration for `name` and disposes the current
    /// publisher so the next request rebuilds it with the new settings.
    pub async fn reload(&self, name: &str, config: AmqpConfig) {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            state.configs.insert(name.to_owned(), config);
            state.publishers.remove(name)
        };

        if let Some(publisher) = evicted {
            info!(name, "configuration reloaded, disposing publisher");
            publisher.close().await;
        }
    }

    /// Disposes every cached publisher.
    pub async fn close(&self) {
        let publishers: Vec<Arc<Publisher>> = {
            let mut state = self.state.lock().unwrap();
            state.publishers.drain().map(|(_, p)| p).collect()
        };

        for publisher in publishers {
            publisher.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_configs() -> HashMap<String, AmqpConfig> {
        HashMap::from([
            ("A".to_owned(), AmqpConfig::new("localhost", "guest", "guest")),
            ("B".to_owned(), AmqpConfig::new("localhost", "guest", "guest")),
        ])
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_instance() {
        let pool = PublisherPool::new(named_configs());

        let first = pool.get_or_create("A").unwrap();
        let second = pool.get_or_create("A").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        pool.close().await;
    }

    #[tokio::test]
    async fn distinct_names_get_distinct_publishers() {
        let pool = PublisherPool::new(named_configs());

        let a = pool.get_or_create("A").unwrap();
        let b = pool.get_or_create("B").unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        pool.close().await;
    }

    #[tokio::test]
    async fn reload_evicts_and_disposes_the_previous_instance() {
        let pool = PublisherPool::new(named_configs());

        let before = pool.get_or_create("A").unwrap();
        pool.reload("A", AmqpConfig::new("localhost", "guest", "other"))
            .await;
        let after = pool.get_or_create("A").unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert!(before.is_closed());
        assert!(!after.is_closed());
        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_name_is_a_missing_configuration() {
        let pool = PublisherPool::new(named_configs());

        assert_eq!(
            pool.get_or_create("C").err(),
            Some(AmqpError::MissingConfigurationError("C".to_owned()))
        );
    }

    #[tokio::test]
    async fn publish_requires_an_exchange_or_routing_key() {
        let publisher = Publisher::new(AmqpConfig::new("localhost", "guest", "guest"));

        let result = publisher.publish("", "", b"payload").await;

        assert_eq!(result, Err(AmqpError::MissingRouteError));
        publisher.close().await;
    }

    #[tokio::test]
    async fn a_closed_publisher_refuses_to_publish() {
        let publisher = Publisher::new(AmqpConfig::new("localhost", "guest", "guest"));
        publisher.close().await;
        publisher.close().await;

        let result = publisher.publish("events", "orders.created", b"payload").await;

        assert_eq!(result, Err(AmqpError::ClosedError));
    }
}
