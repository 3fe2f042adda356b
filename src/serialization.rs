// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Body Serialization
//!
//! A closed set of codecs selected by content type through a fixed lookup
//! table. Every codec exposes the same capability: [`Codec::name`],
//! [`Codec::encode`] and [`Codec::decode`].

use crate::errors::AmqpError;
use serde_json::Value;

/// Content type for JSON bodies
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for UTF-8 text bodies
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for opaque binary bodies
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(value)
    }
}

/// Serializers known to the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    Text,
    Binary,
}

const CONTENT_TYPES: &[(&str, Codec)] = &[
    (JSON_CONTENT_TYPE, Codec::Json),
    (TEXT_CONTENT_TYPE, Codec::Text),
    (BINARY_CONTENT_TYPE, Codec::Binary),
];

impl Codec {
    /// Looks up the codec registered for a content type.
    ///
    /// Parameters such as `; charset=utf-8` are ignored.
    pub fn from_content_type(content_type: &str) -> Option<Codec> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        CONTENT_TYPES
            .iter()
            .find(|(ct, _)| *ct == essence)
            .map(|(_, codec)| *codec)
    }

    /// Looks up a codec by its short name (`json`, `text`, `binary`).
    pub fn from_name(name: &str) -> Option<Codec> {
        CONTENT_TYPES
            .iter()
            .map(|(_, codec)| *codec)
            .find(|codec| codec.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::Text => "text",
            Codec::Binary => "binary",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Json => JSON_CONTENT_TYPE,
            Codec::Text => TEXT_CONTENT_TYPE,
            Codec::Binary => BINARY_CONTENT_TYPE,
        }
    }

    pub fn encode(&self, body: &Body) -> Result<Vec<u8>, AmqpError> {
        match (self, body) {
            (Codec::Json, Body::Json(value)) => {
                serde_json::to_vec(value).map_err(|e| AmqpError::SerializationError(e.to_string()))
            }
            (Codec::Json, Body::Text(text)) => serde_json::to_vec(&Value::String(text.clone()))
                .map_err(|e| AmqpError::SerializationError(e.to_string())),
            (Codec::Json, Body::Bytes(_)) => Err(AmqpError::SerializationError(
                "raw bytes cannot be encoded as json".to_owned(),
            )),
            (Codec::Text, Body::Text(text)) => Ok(text.as_bytes().to_vec()),
            (Codec::Text, Body::Json(Value::String(text))) => Ok(text.as_bytes().to_vec()),
            (Codec::Text, Body::Json(value)) => Ok(value.to_string().into_bytes()),
            (Codec::Text, Body::Bytes(bytes)) => std::str::from_utf8(bytes)
                .map(|text| text.as_bytes().to_vec())
                .map_err(|e| AmqpError::SerializationError(e.to_string())),
            (Codec::Binary, Body::Bytes(bytes)) => Ok(bytes.clone()),
            (Codec::Binary, Body::Text(text)) => Ok(text.as_bytes().to_vec()),
            (Codec::Binary, Body::Json(value)) => {
                serde_json::to_vec(value).map_err(|e| AmqpError::SerializationError(e.to_string()))
            }
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Body, AmqpError> {
        match self {
            Codec::Json => serde_json::from_slice(data)
                .map(Body::Json)
                .map_err(|e| AmqpError::SerializationError(e.to_string())),
            Codec::Text => String::from_utf8(data.to_vec())
                .map(Body::Text)
                .map_err(|e| AmqpError::SerializationError(e.to_string())),
            Codec::Binary => Ok(Body::Bytes(data.to_vec())),
        }
    }
}
