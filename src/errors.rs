// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Broker-level failures are represented by [`AmqpError`], task-level failures
//! by [`TaskError`]. The broker errors carry a classification used by the
//! recovery layer: recoverable errors (connection, channel, socket, timeout)
//! are retried with backoff, everything else is surfaced to the caller.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Error establishing a connection, or the connection was lost mid-operation
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The connection was closed and no more events can be drained from it
    #[error("connection closed")]
    ConnectionClosed,

    /// Channel-level failure, the channel must be re-created
    #[error("channel failure `{0}`")]
    ChannelError(String),

    /// Transient I/O failure on the socket
    #[error("socket error `{0}`")]
    SocketError(String),

    /// A blocking operation did not complete in time
    #[error("operation timed out")]
    Timeout,

    /// The broker refused the credentials
    #[error("authentication refused `{0}`")]
    AuthenticationError(String),

    /// Invalid broker url, vhost or settings
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// An entity already exists with different properties
    #[error("declaration conflict `{0}`")]
    DeclarationConflict(String),

    /// A referenced entity does not exist on the broker
    #[error("entity not found `{0}`")]
    NotFound(String),

    /// The broker did not confirm a published message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// A body could not be encoded or decoded
    #[error("failure to serialize payload `{0}`")]
    SerializationError(String),

    /// No serializer registered for the content type
    #[error("unknown content type `{0}`")]
    UnknownContentType(String),

    /// A reply was requested for a message without a reply-to address
    #[error("request has no reply_to address")]
    MissingReplyTo,

    /// The message was already acknowledged, rejected or requeued
    #[error("message already acknowledged with state `{0}`")]
    MessageStateError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming from a queue
    #[error("failure to consume `{0}`")]
    ConsumerError(String),

    /// No pooled connection became available in time
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    /// The retry policy gave up
    #[error("retries exhausted after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
}

impl AmqpError {
    /// Errors that a reconnect-and-retry can fix.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ConnectionClosed
                | AmqpError::ChannelError(_)
                | AmqpError::SocketError(_)
                | AmqpError::Timeout
        )
    }

    /// Transient socket hiccups that the event loop swallows.
    pub fn is_socket_error(&self) -> bool {
        matches!(self, AmqpError::SocketError(_))
    }
}

/// Errors returned by task handlers and the task dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The payload could not be decoded
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The task references a record that does not exist
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// No handler is registered for the task name
    #[error("unknown task `{0}`")]
    UnknownTask(String),

    /// Failure expected to succeed on redelivery
    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Broker(#[from] AmqpError),
}

impl TaskError {
    /// Permanent failures are never redelivered.
    pub fn is_permanent(&self) -> bool {
        match self {
            TaskError::MalformedPayload(_)
            | TaskError::TargetNotFound(_)
            | TaskError::UnknownTask(_) => true,
            TaskError::Transient(_) => false,
            TaskError::Broker(err) => !err.is_recoverable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_recoverable_errors() {
        assert!(AmqpError::ConnectionError("reset".to_owned()).is_recoverable());
        assert!(AmqpError::ConnectionClosed.is_recoverable());
        assert!(AmqpError::Timeout.is_recoverable());
        assert!(!AmqpError::AuthenticationError("guest".to_owned()).is_recoverable());
        assert!(!AmqpError::DeclarationConflict("tasks".to_owned()).is_recoverable());
    }

    #[test]
    fn broker_errors_inside_tasks_keep_their_class() {
        assert!(!TaskError::Broker(AmqpError::SocketError("eof".to_owned())).is_permanent());
        assert!(TaskError::Broker(AmqpError::NotFound("q".to_owned())).is_permanent());
        assert!(TaskError::TargetNotFound("x".to_owned()).is_permanent());
        assert!(!TaskError::Transient("db".to_owned()).is_permanent());
    }
}
