//! Work queues and fanout broadcast over RabbitMQ with ack-driven consumption.
//!
//! A [`Producer`] publishes persistent JSON messages; a [`Consumer`] runs one
//! background acknowledgment loop that acks a delivery when the handler
//! succeeds and requeues it when the handler fails.

pub mod config;
pub mod message;
pub mod rabbitmq;

pub use config::RabbitConfig;
pub use rabbitmq::{
    json_handler, Consumer, ConsumerHandle, ConsumerOptions, MessageHandler, Producer,
    ProducerOptions, RabbitMQError, Rejected, RedeliveryPolicy, Result,
};
