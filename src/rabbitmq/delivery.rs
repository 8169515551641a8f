use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::AMQPValue,
};

use super::errors::{RabbitMQError, Result};

/// Header quorum queues use to count earlier delivery attempts.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// One message received from the broker, together with the means to settle it.
#[async_trait]
pub trait InboundDelivery: Send + Sync {
    fn payload(&self) -> &[u8];

    fn delivery_tag(&self) -> u64;

    /// Set by the broker when this message was delivered before.
    fn redelivered(&self) -> bool;

    fn message_id(&self) -> Option<&str>;

    /// Earlier delivery attempts, when the broker reports them.
    fn delivery_count(&self) -> Option<u32>;

    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

#[async_trait]
impl InboundDelivery for Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    fn delivery_count(&self) -> Option<u32> {
        let headers = self.properties.headers().as_ref()?;
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
            .and_then(|(_, value)| amqp_value_as_u32(value))
    }

    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(format!("ack of {} failed: {}", self.delivery_tag, e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| {
                RabbitMQError::AckError(format!("nack of {} failed: {}", self.delivery_tag, e))
            })
    }
}

fn amqp_value_as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}
