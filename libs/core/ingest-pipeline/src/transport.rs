//! Transport seams: receive with headers, send with headers, acknowledge.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::TransportError;
use crate::message::{Headers, Message};

/// Inbound side of the transport
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Stream name, used in logs and metric labels
    fn name(&self) -> &str;

    /// One-off setup before the first receive (e.g. create the consumer group).
    async fn prepare(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Next batch of at most `max` messages. An empty batch is not an error.
    async fn receive(&self, max: usize) -> Result<Vec<Message>, TransportError>;

    async fn ack(&self, id: &str) -> Result<(), TransportError>;

    /// Take over messages abandoned by crashed peers. Transports without
    /// that notion return nothing.
    async fn reclaim(&self, _max: usize) -> Result<Vec<Message>, TransportError> {
        Ok(vec![])
    }
}

/// Outbound side of the transport
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Stream written to
    fn destination(&self) -> &str;

    /// Append a message; returns the transport-assigned id.
    async fn publish(
        &self,
        payload: &[u8],
        headers: &Headers,
        key: Option<&str>,
    ) -> Result<String, TransportError>;
}

#[async_trait]
impl<S: MessageSource + ?Sized> MessageSource for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn prepare(&self) -> Result<(), TransportError> {
        (**self).prepare().await
    }

    async fn receive(&self, max: usize) -> Result<Vec<Message>, TransportError> {
        (**self).receive(max).await
    }

    async fn ack(&self, id: &str) -> Result<(), TransportError> {
        (**self).ack(id).await
    }

    async fn reclaim(&self, max: usize) -> Result<Vec<Message>, TransportError> {
        (**self).reclaim(max).await
    }
}

#[async_trait]
impl<P: MessagePublisher + ?Sized> MessagePublisher for Arc<P> {
    fn destination(&self) -> &str {
        (**self).destination()
    }

    async fn publish(
        &self,
        payload: &[u8],
        headers: &Headers,
        key: Option<&str>,
    ) -> Result<String, TransportError> {
        (**self).publish(payload, headers, key).await
    }
}
