use lapin::{Channel, Connection, ConnectionProperties};
use tokio::time::timeout;
use tracing::{debug, info};

use super::errors::{RabbitMQError, Result};
use crate::config::{redact_uri, ConnectionConfig};

/// One broker connection and the single channel every protocol call of its
/// owning client goes through.
///
/// Failures are returned to the caller as-is; the manager never reconnects.
pub struct ConnectionManager {
    uri: String,
    connection: Connection,
    channel: Channel,
}

impl ConnectionManager {
    pub async fn open(uri: &str) -> Result<Self> {
        info!("Connecting to RabbitMQ at {}", redact_uri(uri));

        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitMQError::connection("failed to connect", e))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                // Don't leak a half-open connection
                let _ = connection.close(0, "channel creation failed").await;
                return Err(RabbitMQError::connection("failed to create channel", e));
            }
        };

        debug!(channel_id = channel.id(), "Channel opened");
        info!("Successfully connected to RabbitMQ");

        Ok(Self {
            uri: redact_uri(uri),
            connection,
            channel,
        })
    }

    /// Like [`ConnectionManager::open`], bounded by `connection_timeout_ms`.
    pub async fn open_with(config: &ConnectionConfig) -> Result<Self> {
        timeout(config.connect_timeout(), Self::open(&config.uri))
            .await
            .map_err(|_| {
                RabbitMQError::TimeoutError(format!(
                    "no connection to {} after {}ms",
                    redact_uri(&config.uri),
                    config.connection_timeout_ms
                ))
            })?
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Non-blocking; false once either side has closed the connection.
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Closes the channel, then the connection. A no-op on a connection that
    /// is already closed.
    pub async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "Closing channel").await {
                debug!("Channel close failed, closing connection anyway: {}", e);
            }
        }

        if self.is_connected() {
            info!("Closing RabbitMQ connection to {}", self.uri);
            self.connection
                .close(200, "Closing connection")
                .await
                .map_err(|e| RabbitMQError::connection("failed to close connection", e))?;
        }
        Ok(())
    }
}
