use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
};
use serde::Serialize;
use tracing::{debug, info};

use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::topology::{declare_fanout_exchange, declare_work_queue};
use crate::config::RabbitConfig;
use crate::message::OutgoingMessage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerOptions {
    /// Wait for the broker to confirm each publish. Without it a successful
    /// send only means the frame was handed to the channel.
    pub publisher_confirms: bool,
}

/// Publishes JSON messages to durable work queues and fanout exchanges.
pub struct Producer {
    manager: ConnectionManager,
    options: ProducerOptions,
}

impl Producer {
    pub async fn new(uri: &str) -> Result<Self> {
        let manager = ConnectionManager::open(uri).await?;
        Self::with_manager(manager, ProducerOptions::default()).await
    }

    pub async fn from_config(config: &RabbitConfig) -> Result<Self> {
        let manager = ConnectionManager::open_with(&config.connection).await?;
        let options = ProducerOptions {
            publisher_confirms: config.producer.publisher_confirms,
        };
        Self::with_manager(manager, options).await
    }

    pub async fn with_manager(manager: ConnectionManager, options: ProducerOptions) -> Result<Self> {
        if options.publisher_confirms {
            debug!("Enabling confirm mode for producer channel");
            manager
                .channel()
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| RabbitMQError::connection("failed to enable confirm mode", e))?;
        }
        Ok(Self { manager, options })
    }

    /// Declares `queue_name` as a durable work queue and publishes `message`
    /// to it, persistent.
    pub async fn send_message<T: Serialize + ?Sized>(&self, queue_name: &str, message: &T) -> Result<()> {
        declare_work_queue(self.manager.channel(), queue_name).await?;

        let outgoing = OutgoingMessage::encode(message)?;
        self.publish("", queue_name, &outgoing).await?;

        info!(
            queue = %queue_name,
            message_id = %outgoing.message_id,
            "Sent message to {}: {}",
            queue_name,
            String::from_utf8_lossy(&outgoing.payload)
        );
        Ok(())
    }

    /// Publishes `message` to every queue currently bound to the fanout
    /// exchange `exchange_name`, declaring the exchange first.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, exchange_name: &str, message: &T) -> Result<()> {
        declare_fanout_exchange(self.manager.channel(), exchange_name).await?;

        let outgoing = OutgoingMessage::encode(message)?;
        self.publish(exchange_name, "", &outgoing).await?;

        info!(
            exchange = %exchange_name,
            message_id = %outgoing.message_id,
            "Broadcast message to {}",
            exchange_name
        );
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, outgoing: &OutgoingMessage) -> Result<()> {
        let target = if exchange.is_empty() { routing_key } else { exchange };
        let confirm = self
            .manager
            .channel()
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &outgoing.payload,
                outgoing.properties(),
            )
            .await
            .map_err(|e| RabbitMQError::publish(format!("failed to publish to '{}'", target), e))?;

        if !self.options.publisher_confirms {
            return Ok(());
        }

        let confirmation = confirm
            .await
            .map_err(|e| RabbitMQError::publish("no publisher confirm", e))?;
        check_confirmation(confirmation, &outgoing.message_id.to_string())
    }

    pub fn options(&self) -> ProducerOptions {
        self.options
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub async fn close(&self) -> Result<()> {
        self.manager.close().await
    }
}

fn check_confirmation(confirmation: Confirmation, message_id: &str) -> Result<()> {
    match confirmation {
        Confirmation::Nack(_) => Err(RabbitMQError::PublishNacked(message_id.to_string())),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}
