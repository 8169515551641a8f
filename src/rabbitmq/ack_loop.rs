//! The acknowledgment loop shared by both consumer modes.
//!
//! Each delivery moves through `Received -> Dispatched -> {Acked | Requeued | Rejected}`
//! and is settled before the next one is pulled from the stream. The loop
//! knows nothing about lapin beyond [`InboundDelivery`], so it runs just as
//! well against an in-memory queue.

use std::collections::HashMap;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::delivery::InboundDelivery;
use super::handler::{is_rejection, MessageHandler};

/// What happens to a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedeliveryPolicy {
    /// Requeue every failure, forever.
    #[default]
    Unbounded,
    /// Reject a failing delivery once it has been redelivered this many times.
    Limited { max_redeliveries: u32 },
}

/// Terminal outcome of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Ack,
    /// Nack with requeue.
    Requeue,
    /// Nack without requeue.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    Success,
    Failed,
    Rejected,
}

impl RedeliveryPolicy {
    pub(crate) fn decide(&self, outcome: HandlerOutcome, redeliveries: u32) -> Decision {
        match outcome {
            HandlerOutcome::Success => Decision::Ack,
            HandlerOutcome::Rejected => Decision::Reject,
            HandlerOutcome::Failed => match self {
                RedeliveryPolicy::Unbounded => Decision::Requeue,
                RedeliveryPolicy::Limited { max_redeliveries } => {
                    if redeliveries >= *max_redeliveries {
                        Decision::Reject
                    } else {
                        Decision::Requeue
                    }
                }
            },
        }
    }
}

/// Counts of settled deliveries for one consumption stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
}

impl ConsumeSummary {
    pub fn total(&self) -> u64 {
        self.acked + self.requeued + self.rejected
    }

    fn record(&mut self, decision: Decision) {
        match decision {
            Decision::Ack => self.acked += 1,
            Decision::Requeue => self.requeued += 1,
            Decision::Reject => self.rejected += 1,
        }
    }
}

const MAX_TRACKED_MESSAGES: usize = 10_000;

/// Local redelivery counts for brokers that don't send `x-delivery-count`.
/// Keyed by message id, so only messages published with one are tracked.
/// When full, the entry seen first is forgotten; a message evicted that way
/// starts counting again from the broker's `redelivered` flag.
#[derive(Debug)]
struct RedeliveryTracker {
    /// message id -> (earlier deliveries, first seen)
    seen: HashMap<String, (u32, u64)>,
    next_seq: u64,
    capacity: usize,
}

impl Default for RedeliveryTracker {
    fn default() -> Self {
        Self::with_capacity(MAX_TRACKED_MESSAGES)
    }
}

impl RedeliveryTracker {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            next_seq: 0,
            capacity: capacity.max(1),
        }
    }

    /// Earlier deliveries of this message.
    fn redeliveries<D: InboundDelivery + ?Sized>(&mut self, delivery: &D) -> u32 {
        if let Some(count) = delivery.delivery_count() {
            return count;
        }

        let flag = u32::from(delivery.redelivered());
        let Some(id) = delivery.message_id() else {
            return flag;
        };

        if self.seen.len() >= self.capacity && !self.seen.contains_key(id) {
            self.evict_oldest();
        }

        let seq = self.next_seq;
        let entry = self.seen.entry(id.to_string()).or_insert_with(|| (0, seq));
        if entry.1 == seq {
            self.next_seq += 1;
        }
        let earlier = entry.0;
        entry.0 += 1;
        // The broker's flag wins when we never saw the first attempt
        earlier.max(flag)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .seen
            .iter()
            .min_by_key(|(_, (_, seq))| *seq)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            debug!(message_id = %id, "Redelivery tracker full, forgetting oldest message");
            self.seen.remove(&id);
        }
    }

    fn settle<D: InboundDelivery + ?Sized>(&mut self, delivery: &D, decision: Decision) {
        if decision == Decision::Requeue {
            return;
        }
        if let Some(id) = delivery.message_id() {
            self.seen.remove(id);
        }
    }
}

async fn dispatch<H: MessageHandler + ?Sized>(handler: &H, payload: &[u8], source: &str) -> HandlerOutcome {
    match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
        Ok(Ok(())) => HandlerOutcome::Success,
        Ok(Err(e)) if is_rejection(&e) => {
            warn!(source = %source, "Handler rejected message: {:#}", e);
            HandlerOutcome::Rejected
        }
        Ok(Err(e)) => {
            error!(source = %source, "Error handling message: {:#}", e);
            HandlerOutcome::Failed
        }
        Err(_) => {
            error!(source = %source, "Handler panicked while handling message");
            HandlerOutcome::Failed
        }
    }
}

async fn settle<D: InboundDelivery>(delivery: &D, decision: Decision, source: &str) {
    let result = match decision {
        Decision::Ack => delivery.ack().await,
        Decision::Requeue => delivery.nack(true).await,
        Decision::Reject => delivery.nack(false).await,
    };

    if let Err(e) = result {
        // The broker requeues unsettled deliveries once the channel goes away
        error!(
            source = %source,
            delivery_tag = delivery.delivery_tag(),
            ?decision,
            "Failed to settle delivery: {}",
            e
        );
    }
}

/// Runs until `deliveries` ends, yields an error, or `cancel` fires. The
/// token is only observed between deliveries; a running handler is never
/// interrupted.
///
/// The stream is borrowed so that, after a cancellation, the caller can stop
/// the broker consumer and hand whatever is still buffered to
/// [`requeue_remaining`].
pub async fn run_ack_loop<S, D, E, H>(
    source: &str,
    deliveries: &mut S,
    handler: &H,
    policy: RedeliveryPolicy,
    cancel: CancellationToken,
) -> ConsumeSummary
where
    S: Stream<Item = Result<D, E>> + Unpin,
    D: InboundDelivery,
    E: Display,
    H: MessageHandler + ?Sized,
{
    let mut tracker = RedeliveryTracker::default();
    let mut summary = ConsumeSummary::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(source = %source, "Consumption cancelled");
                break;
            }
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(source = %source, "Error receiving message: {}", e);
                break;
            }
            None => {
                info!(source = %source, "Delivery stream closed");
                break;
            }
        };

        let redeliveries = tracker.redeliveries(&delivery);
        let outcome = dispatch(handler, delivery.payload(), source).await;
        let decision = policy.decide(outcome, redeliveries);

        if outcome == HandlerOutcome::Failed && decision == Decision::Reject {
            warn!(
                source = %source,
                delivery_tag = delivery.delivery_tag(),
                redeliveries,
                "Giving up on message after repeated failures"
            );
        }

        debug!(
            source = %source,
            delivery_tag = delivery.delivery_tag(),
            redeliveries,
            ?decision,
            "Settling delivery"
        );
        settle(&delivery, decision, source).await;
        tracker.settle(&delivery, decision);
        summary.record(decision);
    }

    info!(
        source = %source,
        acked = summary.acked,
        requeued = summary.requeued,
        rejected = summary.rejected,
        "Consumption loop finished"
    );
    summary
}

/// Nacks with requeue every delivery still buffered in `deliveries`, without
/// running a handler. Stops when the stream ends, errors, or stays idle for
/// `idle`. Returns how many deliveries were handed back.
pub async fn requeue_remaining<S, D, E>(source: &str, deliveries: &mut S, idle: Duration) -> u64
where
    S: Stream<Item = Result<D, E>> + Unpin,
    D: InboundDelivery,
    E: Display,
{
    let mut returned = 0;
    loop {
        match timeout(idle, deliveries.next()).await {
            Ok(Some(Ok(delivery))) => {
                settle(&delivery, Decision::Requeue, source).await;
                returned += 1;
            }
            Ok(Some(Err(e))) => {
                warn!(source = %source, "Error draining buffered deliveries: {}", e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                debug!(source = %source, "No buffered delivery within {:?}", idle);
                break;
            }
        }
    }

    if returned > 0 {
        info!(source = %source, returned, "Returned unhandled deliveries to the queue");
    }
    returned
}
