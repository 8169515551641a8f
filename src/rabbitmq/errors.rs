// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {context}: {source}")]
    ConnectionError {
        context: String,
        #[source]
        source: LapinError,
    },

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("RabbitMQ topology error: {context}: {source}")]
    TopologyError {
        context: String,
        #[source]
        source: LapinError,
    },

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {context}: {source}")]
    PublishError {
        context: String,
        #[source]
        source: LapinError,
    },

    #[error("Broker refused message {0}")]
    PublishNacked(String),

    #[error("RabbitMQ consume error: {context}: {source}")]
    ConsumeError {
        context: String,
        #[source]
        source: LapinError,
    },

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("A consumption stream is already running on this client")]
    AlreadyConsuming,

    #[error("Consumer task failed: {0}")]
    TaskError(#[from] JoinError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub(crate) fn connection(context: impl Into<String>, source: LapinError) -> Self {
        RabbitMQError::ConnectionError {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn topology(context: impl Into<String>, source: LapinError) -> Self {
        RabbitMQError::TopologyError {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn publish(context: impl Into<String>, source: LapinError) -> Self {
        RabbitMQError::PublishError {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn consume(context: impl Into<String>, source: LapinError) -> Self {
        RabbitMQError::ConsumeError {
            context: context.into(),
            source,
        }
    }

    /// True for errors that mean the broker link itself is gone.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError { .. } | RabbitMQError::TimeoutError(_)
        )
    }
}
