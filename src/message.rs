use chrono::{DateTime, Utc};
use lapin::BasicProperties;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::rabbitmq::Result;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// AMQP delivery mode 2: the broker writes the message to disk on durable queues.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A JSON-encoded message ready to be published.
#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub message_id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl OutgoingMessage {
    /// Encodes `message` as JSON and stamps it with a fresh id and the current time.
    pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Self> {
        Ok(Self {
            message_id: Uuid::new_v4(),
            sent_at: Utc::now(),
            payload: encode_json(message)?,
        })
    }

    pub fn properties(&self) -> BasicProperties {
        BasicProperties::default()
            .with_message_id(self.message_id.to_string().into())
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_timestamp(self.sent_at.timestamp().max(0) as u64)
    }
}

pub fn encode_json<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}
