// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! Declares the broker-side topology a subscription relies on: the queue,
//! its dead-letter queue when one is configured, the exchange and the
//! queue-to-exchange binding. Dead-lettering is driven entirely by queue
//! arguments, so a `NackDeadLetter` resolution needs nothing beyond what is
//! installed here.

use crate::{errors::AmqpError, queue::QueueDescriptor};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Exchange types this crate declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Definition of an exchange to declare.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition<'ex> {
    pub(crate) name: &'ex str,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl<'ex> ExchangeDefinition<'ex> {
    pub fn new(name: &'ex str) -> ExchangeDefinition<'ex> {
        ExchangeDefinition {
            name,
            kind: ExchangeKind::Direct,
            durable: false,
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

/// Assembles the declaration arguments for a queue: dead-letter routing,
/// message TTL and maximum length.
pub(crate) fn queue_arguments(def: &QueueDescriptor) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    if let Some(dlq) = def.dlq_name() {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(dlq)),
        );
    }

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    args
}

/// Declares exchanges, queues (with their DLQs) and bindings on a channel.
pub struct AmqpTopology<'tp> {
    channel: Arc<Channel>,
    queues: Vec<&'tp QueueDescriptor>,
    exchanges: Vec<&'tp ExchangeDefinition<'tp>>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Arc<Channel>) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            exchanges: vec![],
        }
    }

    pub fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: &'tp QueueDescriptor) -> Self {
        self.queues.push(def);
        self
    }

    /// Installs the registered topology: exchanges first, then queues and
    /// their DLQs, then bindings.
    pub async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.bind_queues().await
    }

    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exchange in &self.exchanges {
            debug!("creating exchange: {}", exchange.name);

            match self
                .channel
                .exchange_declare(
                    exchange.name,
                    exchange.kind.into(),
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = exchange.name,
                        "error to declare the exchange"
                    );
                    Err(AmqpError::DeclareExchangeError(exchange.name.to_owned()))
                }
                _ => Ok(()),
            }?;
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name());

            if let Some(dlq) = def.dlq_name() {
                self.declare_queue(dlq, def.durable, FieldTable::default())
                    .await?;
            }

            self.declare_queue(
                def.name(),
                def.durable,
                FieldTable::from(queue_arguments(def)),
            )
            .await?;
        }

        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                debug!("queue: {} was created", name);
                Ok(())
            }
        }
    }

    async fn bind_queues(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            let Some(exchange) = def.exchange.as_deref() else {
                continue;
            };
            let routing_key = def.routing_key.as_deref().unwrap_or_default();

            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                def.name(),
                exchange,
                routing_key
            );

            match self
                .channel
                .queue_bind(
                    def.name(),
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    Err(AmqpError::BindingExchangeToQueueError(
                        exchange.to_owned(),
                        def.name().to_owned(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        Ok(())
    }
}
