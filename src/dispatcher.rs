// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Ordered Message Dispatcher
//!
//! Per-key FIFO processing with cross-key concurrency. Messages sharing a
//! dispatch key are handed to user code strictly in arrival order, one at a
//! time; messages with different keys run fully concurrently, bounded only
//! by the broker's prefetch-driven delivery rate.
//!
//! Each key owns a chain of continuations. A continuation first awaits its
//! predecessor's outcome: on predecessor failure it aborts without invoking
//! the handler, requeues its own message and fails in turn, so one failure
//! cascades through every message already enqueued for that key. This
//! poison-key cascade is a documented contract of the dispatcher, carried
//! between continuations as an explicit status rather than a propagated
//! panic.

use crate::{
    handler::{Decoded, HandlerError, MessageHandler, OrderedHandler},
    message::{Acknowledgement, MessageEnvelope},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Outcome of one continuation, observed by its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainStatus {
    Pending,
    Completed,
    Failed,
}

/// Serializes same-key messages while letting distinct keys run in parallel.
///
/// Implements [`MessageHandler`], so a subscriber routes envelopes through it
/// like any other handler; it answers `Acknowledgement::Manual` and resolves
/// each envelope from inside the key's chain instead.
pub struct OrderedDispatcher<H: OrderedHandler> {
    handler: Arc<H>,
    chains: Mutex<HashMap<H::Key, watch::Receiver<ChainStatus>>>,
}

impl<H> OrderedDispatcher<H>
where
    H: OrderedHandler + 'static,
{
    pub fn new(handler: Arc<H>) -> Self {
        OrderedDispatcher {
            handler,
            chains: Mutex::new(HashMap::default()),
        }
    }

    /// Appends the envelope to its key's chain and returns immediately.
    ///
    /// The map mutation is the only critical section; user code never runs
    /// under the lock.
    async fn enqueue(&self, envelope: &MessageEnvelope) -> Result<Acknowledgement, HandlerError> {
        let (key, item) = match self.handler.decode(envelope) {
            Decoded::Rejected(ack) => {
                // malformed messages never consume an ordering slot
                debug!(
                    delivery_tag = envelope.delivery_tag(),
                    message_id = envelope.message_id().unwrap_or_default(),
                    "message rejected before dispatch"
                );
                return Ok(ack);
            }
            Decoded::Accepted { key, item } => (key, item),
        };

        let (tx, rx) = watch::channel(ChainStatus::Pending);

        let predecessor = {
            let mut chains = self.chains.lock().unwrap();
            // drop chains that have already drained to bound the map
            chains.retain(|_, tail| *tail.borrow() == ChainStatus::Pending);
            chains.insert(key.clone(), rx)
        };

        let handler = Arc::clone(&self.handler);
        let envelope = envelope.clone();
        tokio::spawn(run_continuation(handler, key, item, envelope, predecessor, tx));

        Ok(Acknowledgement::Manual)
    }

    /// Waits until every chain currently known to the dispatcher has
    /// drained. Used for graceful shutdown; accepted messages are always
    /// allowed to run to completion.
    pub async fn drain(&self) {
        loop {
            let tails: Vec<watch::Receiver<ChainStatus>> = {
                let mut chains = self.chains.lock().unwrap();
                chains.retain(|_, tail| *tail.borrow() == ChainStatus::Pending);
                chains.values().cloned().collect()
            };

            if tails.is_empty() {
                return;
            }

            for mut tail in tails {
                let _ = tail.wait_for(|status| *status != ChainStatus::Pending).await;
            }
        }
    }

    #[cfg(test)]
    fn chain_len(&self) -> usize {
        self.chains.lock().unwrap().len()
    }
}

/// One link in a key's chain: await the predecessor, then either cascade its
/// failure or hand the item to user code and apply the returned decision.
async fn run_continuation<H: OrderedHandler>(
    handler: Arc<H>,
    key: H::Key,
    item: H::Item,
    envelope: MessageEnvelope,
    predecessor: Option<watch::Receiver<ChainStatus>>,
    tx: watch::Sender<ChainStatus>,
) {
    let prior = match predecessor {
        // an absent tail is an already-drained chain
        None => ChainStatus::Completed,
        Some(mut tail) => match tail.wait_for(|status| *status != ChainStatus::Pending).await {
            Ok(status) => *status,
            Err(_) => ChainStatus::Failed,
        },
    };

    if prior == ChainStatus::Failed {
        warn!(
            key = ?key,
            delivery_tag = envelope.delivery_tag(),
            "processing chain aborted, requeuing without handling"
        );
        if let Err(err) = envelope.resolve(Acknowledgement::NackRequeue).await {
            error!(error = err.to_string(), key = ?key, "error whiling requeuing aborted msg");
        }
        let _ = tx.send(ChainStatus::Failed);
        return;
    }

    match handler.process(item).await {
        Ok(ack) => match envelope.resolve(ack).await {
            Ok(()) => {
                let _ = tx.send(ChainStatus::Completed);
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    key = ?key,
                    delivery_tag = envelope.delivery_tag(),
                    "error whiling resolving msg"
                );
                envelope.run_error_hook().await;
                let _ = tx.send(ChainStatus::Failed);
            }
        },
        Err(err) => {
            error!(
                error = err.to_string(),
                key = ?key,
                delivery_tag = envelope.delivery_tag(),
                "error whiling processing msg"
            );
            envelope.run_error_hook().await;
            let _ = tx.send(ChainStatus::Failed);
        }
    }
}

#[async_trait]
impl<H> MessageHandler for OrderedDispatcher<H>
where
    H: OrderedHandler + 'static,
{
    fn can_process(&self, handler_tag: &str) -> bool {
        self.handler.can_process(handler_tag)
    }

    async fn process(&self, envelope: &MessageEnvelope) -> Result<Acknowledgement, HandlerError> {
        self.enqueue(envelope).await
    }
}
