// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! [`Producer`] encodes a body with the selected codec, maybe-declares the
//! destination and publishes through the connection's default channel,
//! propagating OpenTelemetry context in the message headers. Publishing
//! waits for the broker's publisher confirm.

use crate::{
    connection::{Connection, Errback},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{OutboundMessage, Properties},
    otel,
    serialization::{Body, Codec},
    topology::{maybe_declare_on, DeclaredEntities, Entity},
    transport::TransportChannel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Where and how a message is published.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub exchange: Option<ExchangeDefinition>,
    pub routing_key: String,
    pub codec: Codec,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Entities maybe-declared before publishing.
    pub declare: Vec<Entity>,
}

impl PublishOptions {
    /// Publishes to the default exchange, routed by queue name.
    pub fn new(routing_key: &str) -> PublishOptions {
        PublishOptions {
            routing_key: routing_key.to_owned(),
            ..PublishOptions::default()
        }
    }

    pub fn exchange(mut self, exchange: &ExchangeDefinition) -> Self {
        self.exchange = Some(exchange.clone());
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    pub fn reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn declare(mut self, entity: impl Into<Entity>) -> Self {
        self.declare.push(entity.into());
        self
    }

    /// Encodes the body and assembles the message properties.
    pub fn build(&self, body: &Body) -> Result<OutboundMessage, AmqpError> {
        let data = self.codec.encode(body)?;

        let mut headers = self.headers.clone();
        otel::inject_current(&mut headers);

        let encoding = match self.codec {
            Codec::Binary => "binary",
            Codec::Json | Codec::Text => "utf-8",
        };
        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut properties = Properties::default()
            .with_content_type(self.codec.content_type())
            .with_content_encoding(encoding)
            .with_message_id(&message_id)
            .with_headers(headers);
        if let Some(correlation_id) = &self.correlation_id {
            properties = properties.with_correlation_id(correlation_id);
        }
        if let Some(reply_to) = &self.reply_to {
            properties = properties.with_reply_to(reply_to);
        }
        if let Some(kind) = &self.kind {
            properties = properties.with_kind(kind);
        }

        Ok(OutboundMessage {
            body: data,
            properties,
        })
    }
}

/// Publishes on an explicit channel, declaring the destination first.
pub async fn publish_on(
    channel: &Arc<dyn TransportChannel>,
    declared: &DeclaredEntities,
    body: &Body,
    options: &PublishOptions,
) -> Result<(), AmqpError> {
    for entity in &options.declare {
        maybe_declare_on(entity, channel, declared).await?;
    }

    let exchange = match &options.exchange {
        Some(exchange) => {
            maybe_declare_on(&Entity::Exchange(exchange.clone()), channel, declared).await?;
            exchange.name()
        }
        None => "",
    };

    let message = options.build(body)?;
    match channel
        .basic_publish(exchange, &options.routing_key, &message)
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                exchange,
                routing_key = options.routing_key,
                "error publishing message"
            );
            Err(err)
        }
        _ => {
            debug!(exchange, routing_key = options.routing_key, "message published");
            Ok(())
        }
    }
}

/// Publishes through a [`Connection`].
pub struct Producer<'a> {
    connection: &'a Connection,
}

impl<'a> Producer<'a> {
    pub fn new(connection: &'a Connection) -> Producer<'a> {
        Producer { connection }
    }

    pub fn connection(&self) -> &Connection {
        self.connection
    }

    pub async fn publish(&self, body: &Body, options: &PublishOptions) -> Result<(), AmqpError> {
        let channel = self.connection.default_channel().await?;
        publish_on(&channel, self.connection.declared(), body, options).await
    }

    /// [`Producer::publish`] through [`Connection::ensure`].
    pub async fn publish_with_retry(
        &self,
        body: &Body,
        options: &PublishOptions,
        errback: Option<&Errback<'_>>,
    ) -> Result<(), AmqpError> {
        let declared = self.connection.declared();
        self.connection
            .ensure(
                |channel| async move { publish_on(&channel, declared, body, options).await },
                errback,
                None,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransportChannel;
    use serde_json::json;

    #[test]
    fn builds_properties_from_options() {
        let options = PublishOptions::new("replies")
            .correlation_id("req-1")
            .reply_to("reply.q")
            .kind("process_torrent")
            .message_id("m-1");

        let message = options.build(&Body::Json(json!({"ok": true}))).unwrap();
        assert_eq!(message.body, br#"{"ok":true}"#);
        assert_eq!(message.properties.content_type(), Some("application/json"));
        assert_eq!(message.properties.content_encoding(), Some("utf-8"));
        assert_eq!(message.properties.correlation_id(), Some("req-1"));
        assert_eq!(message.properties.reply_to(), Some("reply.q"));
        assert_eq!(message.properties.kind(), Some("process_torrent"));
        assert_eq!(message.properties.message_id(), Some("m-1"));
    }

    #[test]
    fn generates_message_ids() {
        let options = PublishOptions::new("q").codec(Codec::Binary);
        let a = options.build(&Body::Bytes(vec![1])).unwrap();
        let b = options.build(&Body::Bytes(vec![1])).unwrap();
        assert_ne!(a.properties.message_id(), b.properties.message_id());
        assert_eq!(a.properties.content_encoding(), Some("binary"));
    }

    #[tokio::test]
    async fn declares_the_exchange_then_publishes() {
        let mut channel = MockTransportChannel::new();
        channel.expect_is_open().returning(|| true);
        channel
            .expect_exchange_declare()
            .withf(|exchange| exchange.name() == "events")
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_basic_publish()
            .withf(|exchange, key, _| exchange == "events" && key == "torrent.created")
            .times(2)
            .returning(|_, _, _| Ok(()));
        let channel: Arc<dyn TransportChannel> = Arc::new(channel);
        let declared = DeclaredEntities::default();

        let options = PublishOptions::new("torrent.created")
            .exchange(&ExchangeDefinition::new("events").topic().durable());
        let body = Body::Json(json!({"id": 1}));
        publish_on(&channel, &declared, &body, &options).await.unwrap();
        publish_on(&channel, &declared, &body, &options).await.unwrap();
    }
}
