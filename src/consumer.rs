// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! The per-delivery path between the subscriber's pump and user code: open a
//! trace span, hand the envelope to the handler, apply the returned
//! acknowledgement, and route failures through the envelope's error hook.

use crate::{
    handler::MessageHandler,
    message::{Acknowledgement, MessageEnvelope},
    otel,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error};

/// Processes one delivery end to end.
///
/// Returns true when the handler reached a decision (including `Manual`,
/// where resolution is deferred); false when processing failed and the
/// error-action policy ran. The caller uses the outcome to reset its
/// consecutive-failure counter.
pub(crate) async fn process_delivery(
    tracer: &BoxedTracer,
    envelope: &MessageEnvelope,
    handler: &Arc<dyn MessageHandler>,
) -> bool {
    let (_ctx, mut span) = otel::consumer_span(envelope.properties(), tracer, envelope.queue());

    debug!(
        queue = envelope.queue(),
        delivery_tag = envelope.delivery_tag(),
        routing_key = envelope.routing_key(),
        "received message"
    );

    match handler.process(envelope).await {
        Ok(ack) => {
            if ack == Acknowledgement::Manual {
                // resolution was deferred, typically into an ordered chain
                span.set_status(Status::Ok);
                return true;
            }
            match envelope.resolve(ack).await {
                Ok(()) => {
                    debug!("message successfully processed");
                    span.set_status(Status::Ok);
                    true
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = envelope.queue(),
                        delivery_tag = envelope.delivery_tag(),
                        "error whiling resolving msg"
                    );
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to resolve msg"),
                    });
                    false
                }
            }
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = envelope.queue(),
                delivery_tag = envelope.delivery_tag(),
                message_id = envelope.message_id().unwrap_or_default(),
                "error whiling handling msg"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
            envelope.run_error_hook().await;
            false
        }
    }
}
