// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Handles one item of a consumer stream:
//! 1. Opens a consumer span from the trace context in the headers
//! 2. Decrypts the payload (skipped for broker cancellation notices)
//! 3. Invokes the registered handler
//! 4. Acknowledges the message only when the handler succeeded
//!
//! A failing handler or an undecryptable payload leaves the message
//! unacknowledged. No nack or requeue is issued; redelivery is up to the broker.

use crate::{
    crypto::Cryptographer,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    transport::Incoming,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// A subscription bound to a queue on the current connection.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) exchange: String,
    pub(crate) channel: String,
    pub(crate) topic: String,
    pub(crate) queue: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) cryptographer: Cryptographer,
}

impl Subscription {
    fn message(&self, routing_key: &str, payload: Option<String>) -> ConsumerMessage {
        ConsumerMessage {
            exchange: self.exchange.clone(),
            channel: self.channel.clone(),
            topic: self.topic.clone(),
            queue: self.queue.clone(),
            routing_key: routing_key.to_owned(),
            payload,
        }
    }
}

pub(crate) async fn process(
    tracer: &BoxedTracer,
    incoming: Incoming,
    sub: &Subscription,
) -> Result<(), AmqpError> {
    let delivery = match incoming {
        Incoming::Delivery(delivery) => delivery,
        Incoming::Cancelled => {
            warn!(queue = %sub.queue, "consumer cancelled by the broker");
            let msg = sub.message("", None);
            return sub
                .handler
                .exec(&msg)
                .await
                .map_err(|err| AmqpError::HandlerError(err.to_string()));
        }
    };

    let mut headers = delivery.headers();
    let (_ctx, mut span) = otel::new_span(&mut headers, tracer, &sub.topic);

    debug!(
        "received: {} - exchange: {}",
        delivery.routing_key(),
        sub.exchange,
    );

    let payload = match std::str::from_utf8(delivery.data())
        .map_err(|err| AmqpError::DecryptionError(err.to_string()))
        .and_then(|text| sub.cryptographer.decrypt_to_string(text))
    {
        Ok(payload) => payload,
        Err(err) => {
            error!(error = %err, queue = %sub.queue, "failure to decrypt message");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to decrypt message"),
            });
            return Err(err);
        }
    };

    let msg = sub.message(delivery.routing_key(), Some(payload));

    if let Err(err) = sub.handler.exec(&msg).await {
        warn!(error = %err, queue = %sub.queue, "handler failed, message left unacknowledged");
        span.set_status(Status::Error {
            description: Cow::from("handler failure"),
        });
        return Err(AmqpError::HandlerError(err.to_string()));
    }

    match delivery.ack().await {
        Err(err) => {
            error!("error whiling ack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(err)
        }
        _ => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            Ok(())
        }
    }
}
