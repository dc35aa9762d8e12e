//! MongoDB persister: idempotent upsert keyed by the payload identity

use async_trait::async_trait;
use mongodb::bson::{Document, doc, to_document};
use mongodb::error::{Error as MongoError, ErrorKind as MongoErrorKind, RETRYABLE_WRITE_ERROR};
use mongodb::{Collection, Database};
use serde::Serialize;
use std::marker::PhantomData;
use tracing::{debug, instrument};

use crate::error::PersistError;
use crate::payload::Payload;
use crate::persister::{Ack, Persister};

/// Writes each payload as one document whose `_id` is [`Payload::key`].
/// Re-delivering the same payload replaces the document (last write wins).
pub struct MongoWriter<T> {
    collection: Collection<Document>,
    _payload: PhantomData<fn(&T)>,
}

impl<T> Clone for MongoWriter<T> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> MongoWriter<T> {
    pub fn new(db: &Database, collection: &str) -> Self {
        Self {
            collection: db.collection::<Document>(collection),
            _payload: PhantomData,
        }
    }

    pub fn collection(&self) -> &Collection<Document> {
        &self.collection
    }
}

impl<T: Payload + Serialize> MongoWriter<T> {
    fn to_document(payload: &T, key: &str) -> Result<Document, PersistError> {
        let mut document = to_document(payload).map_err(|e| {
            PersistError::permanent(format!("payload is not representable as BSON: {e}"))
        })?;
        document.insert("_id", key);
        Ok(document)
    }
}

#[async_trait]
impl<T: Payload + Serialize> Persister<T> for MongoWriter<T> {
    #[instrument(skip_all, fields(collection = %self.collection.name(), key))]
    async fn persist(&self, payload: &T) -> Result<Ack, PersistError> {
        let key = payload.key();
        tracing::Span::current().record("key", key.as_str());

        let document = Self::to_document(payload, &key)?;
        let result = self
            .collection
            .replace_one(doc! { "_id": key.as_str() }, document)
            .upsert(true)
            .await
            .map_err(classify_error)?;

        let created = result.upserted_id.is_some();
        debug!(created, matched = result.matched_count, "Upserted document");
        Ok(Ack { key, created })
    }

    fn name(&self) -> &'static str {
        "mongo"
    }
}

/// Split driver errors into retryable and terminal.
///
/// Network trouble, server selection, pool resets and anything the driver
/// labels as a retryable write are transient. Serialization, write errors
/// (duplicate key, validation) and command errors are permanent.
pub fn classify_error(err: MongoError) -> PersistError {
    if err.contains_label(RETRYABLE_WRITE_ERROR) {
        return PersistError::transient(err.to_string());
    }

    match err.kind.as_ref() {
        MongoErrorKind::Io(_)
        | MongoErrorKind::ServerSelection { .. }
        | MongoErrorKind::ConnectionPoolCleared { .. } => PersistError::transient(err.to_string()),
        _ => PersistError::permanent(err.to_string()),
    }
}
