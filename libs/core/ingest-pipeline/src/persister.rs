//! Durable storage seam

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::PersistError;

/// Storage acknowledgement for one upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub key: String,
    /// True when the upsert inserted a new document
    pub created: bool,
}

/// Writes a validated payload; must be an idempotent upsert keyed on the
/// payload's identity (last write wins).
#[async_trait]
pub trait Persister<T>: Send + Sync {
    async fn persist(&self, payload: &T) -> Result<Ack, PersistError>;

    /// Short name used in logs and metric labels
    fn name(&self) -> &'static str {
        "persister"
    }
}

#[async_trait]
impl<T, P> Persister<T> for Arc<P>
where
    T: Sync,
    P: Persister<T> + ?Sized,
{
    async fn persist(&self, payload: &T) -> Result<Ack, PersistError> {
        (**self).persist(payload).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
