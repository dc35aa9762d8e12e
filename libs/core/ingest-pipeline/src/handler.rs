//! Handler: the single entry point per received message
//!
//! Drives one delivery through decode, validation and persistence to a
//! terminal outcome from the transport's point of view:
//!
//! ```text
//! Received -> Validating -> Persisting -> Succeeded
//!                  |             |-> RetryScheduled -> (timer) -> Validating
//!                  |             '-> DeadLettered
//!                  '-> DeadLettered
//! ```

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tracing::{debug, info, instrument, warn};

use crate::error::ErrorKind;
use crate::message::Message;
use crate::metrics::PipelineMetrics;
use crate::payload::{Payload, decode};
use crate::persister::{Ack, Persister};
use crate::retry::{RetryDecision, RetryState, RetryTracker};
use crate::router::{ErrorRouter, FailureRecord};
use crate::scheduler::RetryScheduler;
use crate::validator::{ValidationResult, Validator};

/// A message plus the retry state it has accumulated so far
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: Message,
    pub state: RetryState,
}

impl Delivery {
    /// First delivery of a freshly received message
    pub fn new(message: Message) -> Self {
        let state = RetryState::starting_at(message.timestamp);
        Self { message, state }
    }
}

/// Processing stage, used as a log field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Received,
    Validating,
    Persisting,
    Succeeded,
    RetryScheduled,
    DeadLettered,
}

/// Terminal result of one `handle` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { ack: Ack, attempts: u32 },
    /// Handed to the timer queue; `attempts` includes this retry
    RetryScheduled { attempts: u32, delay: Duration },
    /// `routed` is false when every sink attempt failed and the record was dropped
    DeadLettered {
        kind: ErrorKind,
        attempts: u32,
        routed: bool,
    },
}

impl Outcome {
    pub fn stage(&self) -> Stage {
        match self {
            Outcome::Succeeded { .. } => Stage::Succeeded,
            Outcome::RetryScheduled { .. } => Stage::RetryScheduled,
            Outcome::DeadLettered { .. } => Stage::DeadLettered,
        }
    }
}

/// What the worker drives. Implemented by [`Handler`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> Outcome;

    /// Give up on a delivery whose retry will never run (shutdown, or the
    /// timer queue is gone) and route it as a transient failure.
    async fn abandon(&self, delivery: Delivery) -> Outcome;
}

/// Validator -> Persister -> Retry Tracker -> Error Router, composed at
/// construction.
pub struct Handler<T, V, P, R> {
    validator: V,
    persister: P,
    router: R,
    tracker: RetryTracker,
    scheduler: RetryScheduler,
    metrics: PipelineMetrics,
    _payload: PhantomData<fn() -> T>,
}

impl<T, V, P, R> Handler<T, V, P, R>
where
    T: Payload,
    V: Validator<T> + 'static,
    P: Persister<T> + 'static,
    R: ErrorRouter + 'static,
{
    pub fn new(
        validator: V,
        persister: P,
        router: R,
        tracker: RetryTracker,
        scheduler: RetryScheduler,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            validator,
            persister,
            router,
            tracker,
            scheduler,
            metrics,
            _payload: PhantomData,
        }
    }

    #[instrument(
        name = "handle",
        skip_all,
        fields(
            message_id = %delivery.message.id,
            source = %delivery.message.source,
            attempts = delivery.state.attempts,
        )
    )]
    async fn process(&self, delivery: Delivery) -> Outcome {
        let start = Instant::now();
        let Delivery { mut message, state } = delivery;
        debug!(stage = %Stage::Validating, age_ms = message.age_ms(), "Handling message");

        let payload: T = match decode(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                let attempts = state.attempts;
                return self
                    .dead_letter(message, ErrorKind::Decode, e.to_string(), attempts, start)
                    .await;
            }
        };

        let key = payload.key();
        if message.key.is_none() {
            message.key = Some(key.clone());
        }

        let verdict = self.validator.validate(&payload);
        if let ValidationResult::Invalid(_) = verdict {
            let attempts = state.attempts;
            return self
                .dead_letter(message, ErrorKind::Validation, verdict.describe(), attempts, start)
                .await;
        }

        debug!(stage = %Stage::Persisting, key = %key, "Persisting");
        match self.persister.persist(&payload).await {
            Ok(ack) => {
                self.metrics.succeeded(start.elapsed());
                info!(
                    key = %ack.key,
                    created = ack.created,
                    attempts = state.attempts,
                    persister = self.persister.name(),
                    "Message persisted"
                );
                Outcome::Succeeded {
                    ack,
                    attempts: state.attempts,
                }
            }
            Err(err) if !err.kind().is_retryable() => {
                let attempts = state.attempts;
                self.dead_letter(message, err.kind(), err.message().to_string(), attempts, start)
                    .await
            }
            Err(err) => {
                let reason = err.message().to_string();
                match self.tracker.on_transient_failure(state, &reason) {
                    RetryDecision::Retry { state, delay } => {
                        let attempts = state.attempts;
                        match self.scheduler.schedule(Delivery { message, state }, delay) {
                            Ok(()) => {
                                self.metrics.retry_scheduled(attempts, delay);
                                self.metrics.pending_retries(self.scheduler.pending());
                                warn!(
                                    key = %key,
                                    attempt = attempts,
                                    max_retries = self.tracker.policy().max_retries,
                                    delay_ms = delay.as_millis() as u64,
                                    error = %reason,
                                    "Transient persist failure, retry scheduled"
                                );
                                Outcome::RetryScheduled { attempts, delay }
                            }
                            Err(delivery) => {
                                warn!(key = %key, "Retry queue closed, dead-lettering");
                                self.abandon(delivery).await
                            }
                        }
                    }
                    RetryDecision::Exhausted { state } => {
                        self.dead_letter(
                            message,
                            ErrorKind::TransientPersist,
                            reason,
                            state.attempts,
                            start,
                        )
                        .await
                    }
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        message: Message,
        kind: ErrorKind,
        reason: String,
        attempts: u32,
        start: Instant,
    ) -> Outcome {
        warn!(
            stage = %Stage::DeadLettered,
            key = ?message.key,
            error_kind = %kind,
            error = %reason,
            attempts,
            "Routing message to error channel"
        );

        let record = FailureRecord::new(message, kind, reason, attempts);
        // The router has already logged the full record on failure
        let routed = self.router.route(record).await.is_ok();

        self.metrics.dead_lettered(kind, start.elapsed());
        Outcome::DeadLettered {
            kind,
            attempts,
            routed,
        }
    }
}

#[async_trait]
impl<T, V, P, R> MessageHandler for Handler<T, V, P, R>
where
    T: Payload,
    V: Validator<T> + 'static,
    P: Persister<T> + 'static,
    R: ErrorRouter + 'static,
{
    async fn handle(&self, delivery: Delivery) -> Outcome {
        self.process(delivery).await
    }

    async fn abandon(&self, delivery: Delivery) -> Outcome {
        let Delivery { message, state } = delivery;
        let reason = state
            .last_error
            .clone()
            .unwrap_or_else(|| "retry abandoned".to_string());
        self.dead_letter(
            message,
            ErrorKind::TransientPersist,
            reason,
            state.attempts,
            Instant::now(),
        )
        .await
    }
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, delivery: Delivery) -> Outcome {
        (**self).handle(delivery).await
    }

    async fn abandon(&self, delivery: Delivery) -> Outcome {
        (**self).abandon(delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_delivery_state() {
        let message = Message::new("1700000000000-0", "users", b"{}".to_vec());
        let delivery = Delivery::new(message.clone());
        assert_eq!(delivery.state.attempts, 0);
        assert_eq!(delivery.state.first_seen_at, message.timestamp);
        assert!(delivery.state.first_failure_at.is_none());
    }

    #[test]
    fn test_outcome_stage() {
        let outcome = Outcome::DeadLettered {
            kind: ErrorKind::Validation,
            attempts: 0,
            routed: true,
        };
        assert_eq!(outcome.stage(), Stage::DeadLettered);
        assert_eq!(Stage::RetryScheduled.to_string(), "retry_scheduled");
    }
}
