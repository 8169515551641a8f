use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::{
    options::BasicCancelOptions,
    types::FieldTable,
    Channel,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::ack_loop::{requeue_remaining, run_ack_loop, ConsumeSummary, RedeliveryPolicy};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::handler::MessageHandler;
use super::topology::{consume_options, declare_fanout_exchange, declare_subscription, declare_work_queue};
use crate::config::RabbitConfig;

/// How long to wait for more buffered deliveries after a cancel before
/// giving up on the drain.
const DRAIN_IDLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub redelivery: RedeliveryPolicy,
}

/// Consumes one queue or fanout exchange at a time and settles every
/// delivery according to the handler's result.
///
/// All protocol calls share the client's single channel, so at most one
/// consumption stream may be active per `Consumer`.
pub struct Consumer {
    manager: ConnectionManager,
    options: ConsumerOptions,
    active: Arc<AtomicBool>,
}

/// Marks the client's single stream slot as taken until dropped.
struct ActiveStream(Arc<AtomicBool>);

impl ActiveStream {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RabbitMQError::AlreadyConsuming)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A running consumption task.
///
/// Dropping the handle leaves the task running; it then stops only when the
/// connection closes.
pub struct ConsumerHandle {
    queue_name: String,
    consumer_tag: String,
    cancel: CancellationToken,
    task: JoinHandle<ConsumeSummary>,
}

impl ConsumerHandle {
    /// For fanout subscriptions, the name the broker generated.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Ask the loop to stop after the delivery it is handling, if any.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the loop and waits for the task to exit. Deliveries the broker
    /// already pushed but the handler never saw are nacked back to the queue
    /// and counted as requeued.
    pub async fn shutdown(self) -> Result<ConsumeSummary> {
        self.cancel.cancel();
        Ok(self.task.await?)
    }

    /// Waits for the task to exit on its own, e.g. after the connection closed.
    pub async fn join(self) -> Result<ConsumeSummary> {
        Ok(self.task.await?)
    }
}

impl Consumer {
    pub async fn new(uri: &str) -> Result<Self> {
        let manager = ConnectionManager::open(uri).await?;
        Ok(Self::with_manager(manager, ConsumerOptions::default()))
    }

    pub async fn from_config(config: &RabbitConfig) -> Result<Self> {
        let manager = ConnectionManager::open_with(&config.connection).await?;
        let options = ConsumerOptions {
            redelivery: config.consumer.redelivery_policy(),
        };
        Ok(Self::with_manager(manager, options))
    }

    pub fn with_manager(manager: ConnectionManager, options: ConsumerOptions) -> Self {
        Self {
            manager,
            options,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Consumes the durable work queue `queue_name`.
    ///
    /// Returns once the delivery stream is open; deliveries are handled in a
    /// background task.
    pub async fn start_consuming<H: MessageHandler>(&self, queue_name: &str, handler: H) -> Result<ConsumerHandle> {
        let guard = ActiveStream::acquire(&self.active)?;
        let channel = self.manager.channel();

        declare_work_queue(channel, queue_name).await?;
        let handle = self
            .spawn_stream(guard, queue_name.to_string(), false, Arc::new(handler))
            .await?;

        info!("Started consuming from queue: {}", queue_name);
        Ok(handle)
    }

    /// Subscribes to the fanout exchange `exchange_name` through an exclusive,
    /// auto-delete queue that lives only as long as this connection. Messages
    /// published while the subscriber is offline are not seen.
    pub async fn start_consuming_from_fanout<H: MessageHandler>(
        &self,
        exchange_name: &str,
        handler: H,
    ) -> Result<ConsumerHandle> {
        let guard = ActiveStream::acquire(&self.active)?;
        let channel = self.manager.channel();

        declare_fanout_exchange(channel, exchange_name).await?;
        let queue_name = declare_subscription(channel, exchange_name).await?;
        let handle = self
            .spawn_stream(guard, queue_name.clone(), true, Arc::new(handler))
            .await?;

        info!(
            "Started consuming from fanout exchange: {} (using auto-generated queue: {})",
            exchange_name, queue_name
        );
        Ok(handle)
    }

    async fn spawn_stream(
        &self,
        guard: ActiveStream,
        queue_name: String,
        exclusive: bool,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle> {
        let channel = self.manager.channel().clone();
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());

        let mut deliveries = channel
            .basic_consume(
                &queue_name,
                &consumer_tag,
                consume_options(exclusive),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::consume(format!("failed to consume from '{}'", queue_name), e)
            })?;

        let cancel = CancellationToken::new();
        let policy = self.options.redelivery;
        let task = tokio::spawn({
            let cancel = cancel.clone();
            let queue_name = queue_name.clone();
            let consumer_tag = consumer_tag.clone();
            async move {
                let _guard = guard;
                let mut summary =
                    run_ack_loop(&queue_name, &mut deliveries, handler.as_ref(), policy, cancel.clone()).await;
                if cancel.is_cancelled() && cancel_broker_consumer(&channel, &consumer_tag).await {
                    summary.requeued += requeue_remaining(&queue_name, &mut deliveries, DRAIN_IDLE).await;
                }
                summary
            }
        });

        Ok(ConsumerHandle {
            queue_name,
            consumer_tag,
            cancel,
            task,
        })
    }

    pub fn options(&self) -> ConsumerOptions {
        self.options
    }

    /// True while a consumption task owns this client's channel.
    pub fn is_consuming(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Closes the connection, which also ends any running consumption task.
    pub async fn close(&self) -> Result<()> {
        self.manager.close().await
    }
}

// basic.cancel only stops new pushes; deliveries already buffered on the
// client stay unacked until they are nacked or the channel closes. Returns
// false when the channel is gone, in which case the broker has already
// taken them back.
async fn cancel_broker_consumer(channel: &Channel, consumer_tag: &str) -> bool {
    if !channel.status().connected() {
        return false;
    }
    if let Err(e) = channel
        .basic_cancel(consumer_tag, BasicCancelOptions::default())
        .await
    {
        warn!(consumer_tag = %consumer_tag, "Failed to cancel broker consumer: {}", e);
    }
    true
}
