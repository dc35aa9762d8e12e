//! End-to-end handling through the real Handler, RetryTracker and timer
//! queue, with in-memory storage and a recording error router.

use async_trait::async_trait;
use ingest_pipeline::{
    Ack, Delivery, DeriveValidator, ErrorKind, ErrorRouter, FailureRecord, Handler,
    MessageHandler, Message, Outcome, Payload, PersistError, Persister, PipelineMetrics,
    RetryConfig, RetryScheduler, RetryTracker, RouteError, router::headers,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
struct Account {
    #[validate(length(min = 1))]
    id: String,
    #[validate(range(min = 0))]
    age: Option<i32>,
}

impl Payload for Account {
    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Upserts into a map; scripted failures are consumed first.
#[derive(Default)]
struct MemoryStore {
    script: Mutex<VecDeque<PersistError>>,
    always: Mutex<Option<PersistError>>,
    docs: Mutex<HashMap<String, Account>>,
    calls: Mutex<usize>,
}

impl MemoryStore {
    fn failing_then_ok(failures: Vec<PersistError>) -> Arc<Self> {
        let store = Self::default();
        *store.script.lock().unwrap() = failures.into();
        Arc::new(store)
    }

    fn always_failing(err: PersistError) -> Arc<Self> {
        let store = Self::default();
        *store.always.lock().unwrap() = Some(err);
        Arc::new(store)
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Persister<Account> for MemoryStore {
    async fn persist(&self, payload: &Account) -> Result<Ack, PersistError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(err) = self.always.lock().unwrap().clone() {
            return Err(err);
        }
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        let previous = self
            .docs
            .lock()
            .unwrap()
            .insert(payload.key(), payload.clone());
        Ok(Ack {
            key: payload.key(),
            created: previous.is_none(),
        })
    }
}

#[derive(Default)]
struct RecordingRouter {
    records: Mutex<Vec<FailureRecord>>,
}

impl RecordingRouter {
    fn records(&self) -> Vec<FailureRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl ErrorRouter for RecordingRouter {
    async fn route(&self, record: FailureRecord) -> Result<(), RouteError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

type TestHandler = Handler<Account, DeriveValidator<Account>, Arc<MemoryStore>, Arc<RecordingRouter>>;

struct Pipeline {
    handler: TestHandler,
    ready: UnboundedReceiver<Delivery>,
    store: Arc<MemoryStore>,
    router: Arc<RecordingRouter>,
}

impl Pipeline {
    fn new(store: Arc<MemoryStore>, retry: RetryConfig) -> Self {
        let (scheduler, ready) = RetryScheduler::spawn();
        let router = Arc::new(RecordingRouter::default());
        let handler = Handler::<Account, _, _, _>::new(
            DeriveValidator::new(),
            store.clone(),
            router.clone(),
            RetryTracker::new(retry.into_policy().unwrap()),
            scheduler,
            PipelineMetrics::new("accounts:ingest"),
        );
        Self {
            handler,
            ready,
            store,
            router,
        }
    }

    /// Handle a message and every retry it schedules until a terminal outcome.
    async fn drive(&mut self, message: Message) -> Outcome {
        let mut outcome = self.handler.handle(Delivery::new(message)).await;
        while let Outcome::RetryScheduled { .. } = outcome {
            let retry = self.ready.recv().await.expect("retry comes due");
            outcome = self.handler.handle(retry).await;
        }
        outcome
    }
}

fn retry(max_retries: i64) -> RetryConfig {
    RetryConfig::new(max_retries, 100, 2.0, 1_000)
}

fn message(id: &str, body: &str) -> Message {
    Message::new(id, "accounts:ingest", body.as_bytes().to_vec()).with_header("trace-id", "t-42")
}

#[tokio::test(start_paused = true)]
async fn invalid_payload_is_dead_lettered_without_persisting() {
    let mut pipeline = Pipeline::new(MemoryStore::failing_then_ok(vec![]), retry(3));

    let outcome = pipeline
        .drive(message("1-0", r#"{"id":"u1","age":-5}"#))
        .await;

    assert_eq!(
        outcome,
        Outcome::DeadLettered {
            kind: ErrorKind::Validation,
            attempts: 0,
            routed: true,
        }
    );
    assert_eq!(pipeline.store.calls(), 0);

    let records = pipeline.router.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 0);
    assert_eq!(records[0].key.as_deref(), Some("u1"));
    assert!(records[0].error_message.contains("age"));
    assert_eq!(records[0].headers.get("trace-id").map(String::as_str), Some("t-42"));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_then_success() {
    let store = MemoryStore::failing_then_ok(vec![
        PersistError::transient("connection reset"),
        PersistError::transient("connection reset"),
    ]);
    let mut pipeline = Pipeline::new(store, retry(3));

    let outcome = pipeline.drive(message("2-0", r#"{"id":"u2"}"#)).await;

    assert!(matches!(outcome, Outcome::Succeeded { attempts: 2, .. }));
    assert_eq!(pipeline.store.calls(), 3);
    assert!(pipeline.router.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_skips_retries() {
    let store = MemoryStore::always_failing(PersistError::permanent("document too large"));
    let mut pipeline = Pipeline::new(store, retry(3));

    let outcome = pipeline.drive(message("3-0", r#"{"id":"u3"}"#)).await;

    assert_eq!(
        outcome,
        Outcome::DeadLettered {
            kind: ErrorKind::PermanentPersist,
            attempts: 0,
            routed: true,
        }
    );
    assert_eq!(pipeline.store.calls(), 1);
    assert_eq!(pipeline.router.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn always_transient_exhausts_after_max_retries() {
    let store = MemoryStore::always_failing(PersistError::transient("no primary"));
    let mut pipeline = Pipeline::new(store, retry(4));

    let started = Instant::now();
    let outcome = pipeline.drive(message("4-0", r#"{"id":"u4"}"#)).await;

    assert_eq!(
        outcome,
        Outcome::DeadLettered {
            kind: ErrorKind::TransientPersist,
            attempts: 4,
            routed: true,
        }
    );
    assert_eq!(pipeline.store.calls(), 5);

    let records = pipeline.router.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 4);
    assert_eq!(records[0].error_message, "no primary");
    assert_eq!(records[0].kind, ErrorKind::TransientPersist);

    // 100 + 200 + 400 + 800
    assert!(started.elapsed() >= Duration::from_millis(1_500));

    let sent = records[0].failure_headers();
    assert_eq!(sent[headers::RETRY_ATTEMPTS], "4");
    assert_eq!(sent[headers::ERROR_KIND], "transient_persist");
}

#[tokio::test(start_paused = true)]
async fn zero_retries_dead_letters_on_first_transient_failure() {
    let store = MemoryStore::always_failing(PersistError::transient("timeout"));
    let mut pipeline = Pipeline::new(store, retry(0));

    let outcome = pipeline.drive(message("5-0", r#"{"id":"u5"}"#)).await;

    assert!(matches!(
        outcome,
        Outcome::DeadLettered {
            kind: ErrorKind::TransientPersist,
            attempts: 0,
            ..
        }
    ));
    assert_eq!(pipeline.store.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn undecodable_payload_never_reaches_storage() {
    let mut pipeline = Pipeline::new(MemoryStore::failing_then_ok(vec![]), retry(3));

    let outcome = pipeline.drive(message("6-0", "not json")).await;

    assert!(matches!(
        outcome,
        Outcome::DeadLettered {
            kind: ErrorKind::Decode,
            attempts: 0,
            ..
        }
    ));
    assert_eq!(pipeline.store.calls(), 0);
    let records = pipeline.router.records();
    assert_eq!(records[0].payload, b"not json");
    assert_eq!(records[0].key, None);
}

#[tokio::test(start_paused = true)]
async fn persisting_twice_matches_persisting_once() {
    let mut pipeline = Pipeline::new(MemoryStore::failing_then_ok(vec![]), retry(3));
    let body = r#"{"id":"u7","age":30}"#;

    let first = pipeline.drive(message("7-0", body)).await;
    let second = pipeline.drive(message("7-1", body)).await;

    assert!(matches!(first, Outcome::Succeeded { ref ack, .. } if ack.created));
    assert!(matches!(second, Outcome::Succeeded { ref ack, .. } if !ack.created));

    let docs = pipeline.store.docs.lock().unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(
        docs["u7"],
        Account {
            id: "u7".to_string(),
            age: Some(30),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn abandoned_retry_is_routed_with_last_error() {
    let store = MemoryStore::always_failing(PersistError::transient("pool cleared"));
    let mut pipeline = Pipeline::new(store, retry(3));

    let outcome = pipeline
        .handler
        .handle(Delivery::new(message("8-0", r#"{"id":"u8"}"#)))
        .await;
    assert!(matches!(outcome, Outcome::RetryScheduled { attempts: 1, .. }));

    let parked = pipeline.ready.recv().await.unwrap();
    let outcome = pipeline.handler.abandon(parked).await;

    assert!(matches!(outcome, Outcome::DeadLettered { attempts: 1, .. }));
    let records = pipeline.router.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_message, "pool cleared");
}
