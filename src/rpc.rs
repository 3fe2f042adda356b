// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request / Reply
//!
//! Replies are published to the requester's `reply_to` queue with the
//! request's correlation id and serializer. [`collect_replies`] drains a
//! reply queue and tells the transport when the queue has served its
//! purpose.

use crate::{
    connection::{ignore_errors, Connection, Errback},
    errors::AmqpError,
    eventloop::{itermessages, EventLoopOptions},
    exchange::ExchangeDefinition,
    message::{Message, Properties},
    pool::ConnectionPool,
    publisher::{publish_on, Producer, PublishOptions},
    queue::QueueDefinition,
    serialization::{Body, Codec},
    transport::TransportChannel,
};
use futures_util::{stream, Stream, StreamExt};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// When a drained reply queue is handed back to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyCleanupPolicy {
    /// Only after at least one reply arrived.
    #[default]
    OnReceipt,
    Always,
    Never,
}

/// Options of [`collect_replies`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectOptions {
    /// Replies are acknowledged by the broker on delivery.
    pub no_ack: bool,
    pub cleanup: ReplyCleanupPolicy,
    pub eventloop: EventLoopOptions,
}

impl Default for CollectOptions {
    fn default() -> Self {
        CollectOptions {
            no_ack: true,
            cleanup: ReplyCleanupPolicy::default(),
            eventloop: EventLoopOptions::default(),
        }
    }
}

/// A reply queue the broker removes after `expires` without consumers.
pub fn reply_queue(name: &str, expires: Option<Duration>) -> QueueDefinition {
    let queue = QueueDefinition::new(name);
    match expires.and_then(|e| i32::try_from(e.as_millis()).ok()) {
        Some(millis) => queue.expires(millis),
        None => queue,
    }
}

/// Publish options answering `request`.
fn reply_options(
    exchange: &ExchangeDefinition,
    request: &Properties,
) -> Result<PublishOptions, AmqpError> {
    let content_type = request.content_type().unwrap_or_default();
    let codec = Codec::from_content_type(content_type)
        .ok_or_else(|| AmqpError::UnknownContentType(content_type.to_owned()))?;
    let reply_to = request.reply_to().ok_or(AmqpError::MissingReplyTo)?;

    let mut options = PublishOptions::new(reply_to).codec(codec);
    if !exchange.is_default() {
        options = options.exchange(exchange);
    }
    if let Some(correlation_id) = request.correlation_id() {
        options = options.correlation_id(correlation_id);
    }
    Ok(options)
}

/// Publishes `body` as the reply to `request`.
pub async fn send_reply(
    exchange: &ExchangeDefinition,
    request: &Message,
    body: &Body,
    producer: &Producer<'_>,
) -> Result<(), AmqpError> {
    let options = reply_options(exchange, request.properties())?;
    producer.publish(body, &options).await
}

/// [`send_reply`] on a pooled connection, retried across reconnects.
pub async fn isend_reply(
    pool: &ConnectionPool,
    exchange: &ExchangeDefinition,
    request: &Properties,
    body: &Body,
    errback: Option<&Errback<'_>>,
) -> Result<(), AmqpError> {
    let options = reply_options(exchange, request)?;
    let conn = pool.acquire().await?;
    let declared = conn.declared();
    let options = &options;

    conn.ensure(
        |channel| async move { publish_on(&channel, declared, body, options).await },
        errback,
        None,
    )
    .await
}

struct ReplyCleanup<'c> {
    connection: &'c Connection,
    queue: String,
    policy: ReplyCleanupPolicy,
    channel: Option<Arc<dyn TransportChannel>>,
    received: bool,
    done: bool,
}

impl ReplyCleanup<'_> {
    fn required(&self) -> bool {
        match self.policy {
            ReplyCleanupPolicy::OnReceipt => self.received,
            ReplyCleanupPolicy::Always => true,
            ReplyCleanupPolicy::Never => false,
        }
    }

    async fn finish(&mut self) {
        self.done = true;
        if !self.required() {
            return;
        }

        let channel = match self.channel.clone() {
            Some(channel) => channel,
            None => match self.connection.default_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    debug!(error = err.to_string(), "reply queue left behind");
                    return;
                }
            },
        };
        if let Err(err) = ignore_errors(channel.after_reply_message_received(&self.queue)).await {
            debug!(error = err.to_string(), queue = self.queue, "reply queue cleanup failed");
        }
    }
}

impl Drop for ReplyCleanup<'_> {
    fn drop(&mut self) {
        if self.done || !self.required() {
            return;
        }
        let (Some(channel), Ok(handle)) = (self.channel.clone(), tokio::runtime::Handle::try_current())
        else {
            return;
        };
        let queue = std::mem::take(&mut self.queue);
        handle.spawn(async move {
            let _ = channel.after_reply_message_received(&queue).await;
        });
    }
}

/// Drains replies from `queue`, yielding each decoded body.
///
/// Replies are acknowledged unless `no_ack` is set. When the stream ends or
/// is dropped the transport is notified that the reply queue is done,
/// according to the cleanup policy.
pub fn collect_replies<'c>(
    connection: &'c Connection,
    queue: &QueueDefinition,
    options: CollectOptions,
) -> impl Stream<Item = Result<Body, AmqpError>> + Send + 'c {
    let replies = Box::pin(itermessages(
        connection,
        queue,
        options.no_ack,
        options.eventloop,
        Vec::new(),
    ));
    let cleanup = ReplyCleanup {
        connection,
        queue: queue.name().to_owned(),
        policy: options.cleanup,
        channel: None,
        received: false,
        done: false,
    };
    let no_ack = options.no_ack;

    stream::unfold(Some((replies, cleanup)), move |state| async move {
        let (mut replies, mut cleanup) = state?;

        match replies.next().await {
            Some(Ok((body, message))) => {
                cleanup.received = true;
                cleanup.channel = Some(message.channel().clone());
                if !no_ack {
                    if let Err(err) = message.ack().await {
                        cleanup.finish().await;
                        return Some((Err(err), None));
                    }
                }
                Some((Ok(body), Some((replies, cleanup))))
            }
            Some(Err(err)) => {
                cleanup.finish().await;
                Some((Err(err), None))
            }
            None => {
                cleanup.finish().await;
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{Delivery, OutboundMessage},
        retry::RetryPolicy,
        transport::{memory::MemoryBroker, MockTransportChannel},
    };
    use serde_json::json;

    fn request(properties: Properties) -> Message {
        let delivery = Delivery {
            consumer_tag: "ctag".to_owned(),
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "rpc".to_owned(),
            redelivered: false,
            body: Vec::new(),
            properties,
        };
        Message::new(delivery, Arc::new(MockTransportChannel::new()), true)
    }

    async fn connect(broker: &MemoryBroker) -> Connection {
        Connection::connect(Arc::new(broker.clone()), RetryPolicy::new(Some(1)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reply_copies_correlation_and_serializer() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let producer = Producer::new(&conn);
        let req = request(
            Properties::default()
                .with_content_type("text/plain")
                .with_reply_to("reply.1")
                .with_correlation_id("req-42"),
        );

        send_reply(
            &ExchangeDefinition::default_exchange(),
            &req,
            &Body::Text("done".to_owned()),
            &producer,
        )
        .await
        .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "reply.1");
        assert_eq!(published[0].message.body, b"done");
        assert_eq!(published[0].message.properties.correlation_id(), Some("req-42"));
        assert_eq!(published[0].message.properties.content_type(), Some("text/plain"));
    }

    #[tokio::test]
    async fn reply_requires_reply_to_and_known_content_type() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let producer = Producer::new(&conn);
        let exchange = ExchangeDefinition::default_exchange();
        let body = Body::Json(json!(1));

        let no_reply_to = request(Properties::default().with_content_type("application/json"));
        assert_eq!(
            send_reply(&exchange, &no_reply_to, &body, &producer).await,
            Err(AmqpError::MissingReplyTo)
        );

        let unknown = request(
            Properties::default()
                .with_content_type("application/x-yaml")
                .with_reply_to("r"),
        );
        assert_eq!(
            send_reply(&exchange, &unknown, &body, &producer).await,
            Err(AmqpError::UnknownContentType("application/x-yaml".to_owned()))
        );
    }

    #[tokio::test]
    async fn collect_acks_and_cleans_up_after_replies() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let queue = reply_queue("reply.7", Some(Duration::from_secs(60)));

        let channel = conn.default_channel().await.unwrap();
        channel.queue_declare(&queue).await.unwrap();
        channel
            .basic_publish(
                "",
                "reply.7",
                &OutboundMessage {
                    body: br#"{"status":"SUCCESS"}"#.to_vec(),
                    properties: Properties::default().with_content_type("application/json"),
                },
            )
            .await
            .unwrap();

        let options = CollectOptions {
            no_ack: false,
            eventloop: EventLoopOptions::new()
                .limit(1)
                .timeout(Duration::from_millis(50)),
            ..CollectOptions::default()
        };
        let replies: Vec<_> = collect_replies(&conn, &queue, options).collect().await;

        assert_eq!(replies, vec![Ok(Body::Json(json!({"status": "SUCCESS"})))]);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.reply_notifications(), vec!["reply.7".to_owned()]);
    }

    #[tokio::test]
    async fn empty_collection_leaves_the_queue_alone() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let queue = reply_queue("reply.8", None);

        let options = CollectOptions {
            eventloop: EventLoopOptions::new()
                .limit(1)
                .timeout(Duration::from_millis(10)),
            ..CollectOptions::default()
        };
        let replies: Vec<_> = collect_replies(&conn, &queue, options).collect().await;

        assert!(replies.is_empty());
        assert!(broker.reply_notifications().is_empty());
        assert!(broker.has_queue("reply.8"));
    }
}
