use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Application logic invoked once per delivery.
///
/// `Ok` acknowledges the delivery. Any error sends it back to the queue,
/// unless the error is (or wraps) [`Rejected`], in which case it is dropped.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()> {
        self(payload)
    }
}

/// Handler failure that retrying can't fix. The delivery is nacked without
/// requeue, so it is dead-lettered if the queue has a dead-letter exchange
/// and discarded otherwise.
#[derive(Debug, Error)]
#[error("message rejected: {reason}")]
pub struct Rejected {
    pub reason: String,
}

impl Rejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub(crate) fn is_rejection(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<Rejected>())
}

/// Handler that decodes the JSON payload into `T` before calling `f`.
pub struct JsonHandler<T, F> {
    f: F,
    _phantom: PhantomData<fn() -> T>,
}

/// Wraps a typed callback; payloads that don't decode as `T` are rejected.
pub fn json_handler<T, F>(f: F) -> JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    JsonHandler {
        f,
        _phantom: PhantomData,
    }
}

#[async_trait]
impl<T, F> MessageHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()> {
        let message: T = serde_json::from_slice(payload)
            .map_err(|e| Rejected::new(format!("payload is not valid JSON for this handler: {}", e)))?;
        (self.f)(message)
    }
}
