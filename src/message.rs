// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Outgoing messages ([`OutboundMessage`]), raw deliveries handed out by a
//! transport ([`Delivery`]) and received messages bound to the channel that
//! delivered them ([`Message`]), which carry the acknowledgement state.

use crate::{
    errors::AmqpError,
    serialization::{Body, Codec},
    transport::TransportChannel,
};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

/// Message metadata.
///
/// The correlation id is write-once: after it has been set, further calls to
/// [`Properties::with_correlation_id`] leave it untouched so replies can
/// always be matched to the request that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    content_type: Option<String>,
    content_encoding: Option<String>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    message_id: Option<String>,
    kind: Option<String>,
    headers: BTreeMap<String, String>,
}

impl Properties {
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_content_encoding(mut self, encoding: &str) -> Self {
        self.content_encoding = Some(encoding.to_owned());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        if self.correlation_id.is_none() {
            self.correlation_id = Some(correlation_id.to_owned());
        }
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    /// Sets the message type, used to route deliveries to task handlers.
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub(crate) fn headers_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.headers
    }
}

/// A message ready to be handed to `basic_publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: Properties,
}

/// A delivery as produced by a transport's drain primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: Properties,
}

/// Acknowledgement state of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Received,
    Acked,
    Rejected,
    Requeued,
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckState::Received => "RECEIVED",
            AckState::Acked => "ACK",
            AckState::Rejected => "REJECTED",
            AckState::Requeued => "REQUEUED",
        };
        f.write_str(name)
    }
}

/// A delivery bound to the channel it arrived on.
///
/// Cloning is cheap and clones share the acknowledgement state.
#[derive(Clone)]
pub struct Message {
    delivery: Arc<Delivery>,
    channel: Arc<dyn TransportChannel>,
    state: Arc<Mutex<AckState>>,
    no_ack: bool,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("delivery", &self.delivery)
            .field("state", &self.state())
            .field("no_ack", &self.no_ack)
            .finish()
    }
}

impl Message {
    pub(crate) fn new(delivery: Delivery, channel: Arc<dyn TransportChannel>, no_ack: bool) -> Self {
        Message {
            delivery: Arc::new(delivery),
            channel,
            state: Arc::new(Mutex::new(AckState::Received)),
            no_ack,
        }
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.body
    }

    pub fn properties(&self) -> &Properties {
        &self.delivery.properties
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn consumer_tag(&self) -> &str {
        &self.delivery.consumer_tag
    }

    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn channel(&self) -> &Arc<dyn TransportChannel> {
        &self.channel
    }

    /// Decodes the body with the codec registered for its content type.
    ///
    /// Messages without a content type are treated as raw bytes.
    pub fn decode(&self) -> Result<Body, AmqpError> {
        let codec = match self.properties().content_type() {
            Some(content_type) => Codec::from_content_type(content_type)
                .ok_or_else(|| AmqpError::UnknownContentType(content_type.to_owned()))?,
            None => Codec::Binary,
        };
        codec.decode(self.body())
    }

    pub fn state(&self) -> AckState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn acknowledged(&self) -> bool {
        self.state() != AckState::Received
    }

    /// Acknowledges the message, removing it from the queue.
    ///
    /// Messages received by a `no_ack` consumer were acknowledged on delivery,
    /// so this is a no-op for them.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.no_ack {
            return Ok(());
        }
        self.transition(AckState::Acked)?;
        let result = self.channel.basic_ack(self.delivery_tag()).await;
        self.settle(result)
    }

    /// Rejects the message; the broker discards or dead-letters it.
    pub async fn reject(&self) -> Result<(), AmqpError> {
        self.transition(AckState::Rejected)?;
        let result = self.channel.basic_reject(self.delivery_tag(), false).await;
        self.settle(result)
    }

    /// Rejects the message and puts it back on the queue.
    pub async fn requeue(&self) -> Result<(), AmqpError> {
        self.transition(AckState::Requeued)?;
        let result = self.channel.basic_reject(self.delivery_tag(), true).await;
        self.settle(result)
    }

    fn transition(&self, next: AckState) -> Result<(), AmqpError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AmqpError::InternalError("message state poisoned".to_owned()))?;
        if *state != AckState::Received {
            return Err(AmqpError::MessageStateError(state.to_string()));
        }
        *state = next;
        Ok(())
    }

    fn settle(&self, result: Result<(), AmqpError>) -> Result<(), AmqpError> {
        if result.is_err() {
            if let Ok(mut state) = self.state.lock() {
                *state = AckState::Received;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransportChannel;

    fn delivery() -> Delivery {
        Delivery {
            consumer_tag: "ctag".to_owned(),
            delivery_tag: 7,
            exchange: String::new(),
            routing_key: "tasks".to_owned(),
            redelivered: false,
            body: br#"{"a":1}"#.to_vec(),
            properties: Properties::default().with_content_type("application/json"),
        }
    }

    #[test]
    fn correlation_id_is_write_once() {
        let props = Properties::default()
            .with_correlation_id("first")
            .with_correlation_id("second");
        assert_eq!(props.correlation_id(), Some("first"));
    }

    #[tokio::test]
    async fn acking_twice_is_a_state_error() {
        let mut channel = MockTransportChannel::new();
        channel
            .expect_basic_ack()
            .withf(|tag| *tag == 7)
            .times(1)
            .returning(|_| Ok(()));

        let msg = Message::new(delivery(), Arc::new(channel), false);
        msg.ack().await.unwrap();
        assert_eq!(msg.state(), AckState::Acked);
        assert_eq!(
            msg.reject().await,
            Err(AmqpError::MessageStateError("ACK".to_owned()))
        );
    }

    #[tokio::test]
    async fn failed_ack_leaves_message_unacknowledged() {
        let mut channel = MockTransportChannel::new();
        channel
            .expect_basic_ack()
            .returning(|_| Err(AmqpError::ChannelError("closed".to_owned())));

        let msg = Message::new(delivery(), Arc::new(channel), false);
        assert!(msg.ack().await.is_err());
        assert!(!msg.acknowledged());
    }

    #[tokio::test]
    async fn no_ack_messages_skip_the_channel() {
        let channel = MockTransportChannel::new();
        let msg = Message::new(delivery(), Arc::new(channel), true);
        msg.ack().await.unwrap();
    }

    #[test]
    fn decodes_by_content_type() {
        let msg = Message::new(delivery(), Arc::new(MockTransportChannel::new()), false);
        assert_eq!(msg.decode().unwrap(), Body::Json(serde_json::json!({"a": 1})));
    }
}
