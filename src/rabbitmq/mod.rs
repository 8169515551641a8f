// src/rabbitmq/mod.rs
// RabbitMQ producer/consumer built on lapin

pub mod errors;
pub mod connection;
pub mod topology;
pub mod delivery;
pub mod handler;
pub mod ack_loop;
pub mod producer;
pub mod consumer;

// Re-export specific items to simplify imports elsewhere
pub use ack_loop::{requeue_remaining, run_ack_loop, ConsumeSummary, Decision, RedeliveryPolicy};
pub use connection::ConnectionManager;
pub use consumer::{Consumer, ConsumerHandle, ConsumerOptions};
pub use delivery::InboundDelivery;
pub use errors::{RabbitMQError, Result};
pub use handler::{json_handler, JsonHandler, MessageHandler, Rejected};
pub use producer::{Producer, ProducerOptions};
