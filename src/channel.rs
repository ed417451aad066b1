// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels, and
//! defines the small acknowledgement seam (`AckChannel`) the rest of the
//! crate uses to resolve deliveries without depending on a live channel.

use crate::{config::AmqpConfig, errors::AmqpError};
use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions},
    types::LongString,
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Establishes a connection to RabbitMQ and opens a channel on it.
///
/// Both are wrapped in `Arc` for sharing between the delivery pump, the
/// envelopes it produces, and the lifecycle manager that will eventually
/// tear them down.
pub async fn new_amqp_channel(
    cfg: &AmqpConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// The channel operations needed to resolve one delivery.
///
/// `lapin::Channel` is the production implementation; tests substitute a
/// mock so acknowledgement and error-policy behavior can be exercised
/// without a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AckChannel: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

#[async_trait]
impl AckChannel for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.status().connected()
    }
}
