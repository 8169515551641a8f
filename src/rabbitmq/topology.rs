// Declare options shared by the producer and both consumer modes. The
// producer and the direct consumer must agree on work-queue properties or
// the broker refuses the second declaration.

use lapin::{
    options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, ExchangeKind,
};
use tracing::{debug, info};

use super::errors::{RabbitMQError, Result};

/// Durable, shared, kept when unused.
pub fn work_queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        auto_delete: false,
        exclusive: false,
        ..QueueDeclareOptions::default()
    }
}

/// Broker-named queue that lives only as long as this connection.
pub fn subscription_queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: false,
        auto_delete: true,
        exclusive: true,
        ..QueueDeclareOptions::default()
    }
}

pub fn fanout_exchange_options() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        auto_delete: false,
        internal: false,
        ..ExchangeDeclareOptions::default()
    }
}

/// Manual ack; `exclusive` only for fanout subscriptions.
pub fn consume_options(exclusive: bool) -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_ack: false,
        exclusive,
        nowait: false,
        ..BasicConsumeOptions::default()
    }
}

pub async fn declare_work_queue(channel: &Channel, queue_name: &str) -> Result<()> {
    let queue = channel
        .queue_declare(queue_name, work_queue_options(), FieldTable::default())
        .await
        .map_err(|e| {
            RabbitMQError::topology(format!("failed to declare queue '{}'", queue_name), e)
        })?;

    debug!(
        queue = %queue_name,
        messages = queue.message_count(),
        consumers = queue.consumer_count(),
        "Queue declared"
    );
    Ok(())
}

pub async fn declare_fanout_exchange(channel: &Channel, exchange_name: &str) -> Result<()> {
    channel
        .exchange_declare(
            exchange_name,
            ExchangeKind::Fanout,
            fanout_exchange_options(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            RabbitMQError::topology(
                format!("failed to declare fanout exchange '{}'", exchange_name),
                e,
            )
        })?;

    debug!(exchange = %exchange_name, "Fanout exchange declared");
    Ok(())
}

/// Declares an anonymous subscription queue, binds it to `exchange_name` and
/// returns the name the broker generated.
pub async fn declare_subscription(channel: &Channel, exchange_name: &str) -> Result<String> {
    let queue = channel
        .queue_declare("", subscription_queue_options(), FieldTable::default())
        .await
        .map_err(|e| RabbitMQError::topology("failed to declare anonymous queue", e))?;
    let queue_name = queue.name().as_str().to_string();

    // Fanout exchanges ignore the routing key
    channel
        .queue_bind(
            &queue_name,
            exchange_name,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            RabbitMQError::topology(
                format!("failed to bind queue '{}' to '{}'", queue_name, exchange_name),
                e,
            )
        })?;

    info!(exchange = %exchange_name, queue = %queue_name, "Subscription queue bound");
    Ok(queue_name)
}
