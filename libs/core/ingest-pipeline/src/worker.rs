//! Worker loop: reads batches, dispatches them onto a bounded pool, feeds due
//! retries back into the same pool and drains cleanly on shutdown.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{CommitMode, WorkerConfig};
use crate::error::PipelineError;
use crate::handler::{Delivery, MessageHandler};
use crate::message::Message;
use crate::metrics::PipelineMetrics;
use crate::scheduler::RetryScheduler;
use crate::transport::MessageSource;

const MAX_BACKOFF_SECS: u64 = 30;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tracks handlers in flight, mirrors the count into a gauge and remembers
/// which transport ids are being handled.
#[derive(Clone)]
struct InFlight {
    count: Arc<AtomicUsize>,
    ids: Arc<Mutex<HashSet<String>>>,
    metrics: PipelineMetrics,
}

impl InFlight {
    fn new(metrics: PipelineMetrics) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            ids: Arc::new(Mutex::new(HashSet::new())),
            metrics,
        }
    }

    fn enter(&self) -> InFlightGuard {
        let now = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.in_flight(now);
        InFlightGuard(self.clone())
    }

    /// Reserve `id` for one handler. `None` while another handler owns it,
    /// which happens when the transport replays an unacknowledged entry.
    fn claim(&self, id: &str) -> Option<IdClaim> {
        if self.lock_ids().insert(id.to_string()) {
            Some(IdClaim {
                ids: self.ids.clone(),
                id: id.to_string(),
            })
        } else {
            None
        }
    }

    fn lock_ids(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct InFlightGuard(InFlight);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now = self.0.count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.0.metrics.in_flight(now);
    }
}

/// Releases the id once the handler and its ack are done
struct IdClaim {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for IdClaim {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

/// Handler tasks plus the deliveries that are already acknowledged on the
/// transport. Those must reach the error router if their task never
/// finishes, because nothing will redeliver them.
struct HandlerTasks {
    set: JoinSet<()>,
    acked: HashMap<Id, Delivery>,
    orphans: Vec<Delivery>,
}

impl HandlerTasks {
    fn new() -> Self {
        Self {
            set: JoinSet::new(),
            acked: HashMap::new(),
            orphans: Vec::new(),
        }
    }

    fn spawn<F>(&mut self, task: F, acked: Option<Delivery>)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.set.spawn(task);
        if let Some(delivery) = acked {
            self.acked.insert(handle.id(), delivery);
        }
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    /// Collect whatever has finished without waiting.
    fn reap(&mut self) {
        while let Some(result) = self.set.try_join_next_with_id() {
            self.finish(result);
        }
    }

    async fn join_all(&mut self) {
        while let Some(result) = self.set.join_next_with_id().await {
            self.finish(result);
        }
    }

    /// Cancel every running handler and wait for the cancellations to land.
    async fn abort_all(&mut self) {
        self.set.abort_all();
        self.join_all().await;
    }

    fn finish(&mut self, result: Result<(Id, ()), JoinError>) {
        match result {
            Ok((id, ())) => {
                self.acked.remove(&id);
            }
            Err(e) => {
                if e.is_panic() {
                    error!(error = %e, "Handler task panicked");
                }
                if let Some(delivery) = self.acked.remove(&e.id()) {
                    self.orphans.push(delivery);
                }
            }
        }
    }

    /// Acknowledged deliveries whose handler was cancelled or panicked
    fn take_orphans(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.orphans)
    }
}

/// What the retry pump hands back at shutdown
struct PumpState {
    ready: mpsc::UnboundedReceiver<Delivery>,
    tasks: HandlerTasks,
    /// Received but never started because shutdown came first
    held: Option<Delivery>,
}

/// Consumes one source with at most `max_concurrent_jobs` handlers running.
///
/// ```rust,ignore
/// let (scheduler, ready) = RetryScheduler::spawn();
/// let handler = Handler::new(validator, writer, router, tracker, scheduler.clone(), metrics);
/// let worker = PipelineWorker::new(source, handler, scheduler, ready, config);
/// worker.run(shutdown_rx).await?;
/// ```
pub struct PipelineWorker<S, H> {
    source: Arc<S>,
    handler: Arc<H>,
    scheduler: RetryScheduler,
    ready: mpsc::UnboundedReceiver<Delivery>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl<S, H> PipelineWorker<S, H>
where
    S: MessageSource + 'static,
    H: MessageHandler,
{
    pub fn new(
        source: S,
        handler: H,
        scheduler: RetryScheduler,
        ready: mpsc::UnboundedReceiver<Delivery>,
        config: WorkerConfig,
    ) -> Self {
        let metrics = PipelineMetrics::new(source.name());
        Self {
            source: Arc::new(source),
            handler: Arc::new(handler),
            scheduler,
            ready,
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            in_flight: InFlight::new(metrics),
            config,
        }
    }

    /// Run until `shutdown` flips to true, then stop reading, wait for
    /// in-flight handlers (bounded by `shutdown_timeout`) and route every
    /// acknowledged delivery that will not finish as a dead letter.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        info!(
            stream = %self.source.name(),
            group = %self.config.consumer_group,
            consumer_id = %self.config.consumer_id,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            batch_size = self.config.batch_size,
            commit_mode = %self.config.commit_mode,
            "Starting pipeline worker"
        );

        self.source.prepare().await?;

        let Self {
            source,
            handler,
            scheduler,
            ready,
            config,
            permits,
            in_flight,
        } = self;

        let pump = tokio::spawn(pump_retries(
            ready,
            handler.clone(),
            permits.clone(),
            in_flight.clone(),
            shutdown.clone(),
        ));

        let worker = Intake {
            source,
            handler,
            config,
            permits,
            in_flight,
        };
        let mut tasks = HandlerTasks::new();
        worker.consume(&mut tasks, &mut shutdown, &scheduler).await;

        info!("Stopped reading, waiting for in-flight handlers");
        let (ready, mut retry_tasks, held) = match pump.await {
            Ok(state) => (Some(state.ready), state.tasks, state.held),
            Err(e) => {
                error!(error = %e, "Retry pump failed");
                (None, HandlerTasks::new(), None)
            }
        };

        let finished = tokio::time::timeout(worker.config.shutdown_timeout, async {
            tasks.join_all().await;
            retry_tasks.join_all().await;
        })
        .await;

        if finished.is_err() {
            warn!(
                timeout_secs = worker.config.shutdown_timeout.as_secs(),
                remaining = tasks.len() + retry_tasks.len(),
                "Shutdown timeout elapsed, aborting in-flight handlers"
            );
            tasks.abort_all().await;
            retry_tasks.abort_all().await;
        }

        // Stop the timer first so nothing new lands on the ready channel.
        let mut leftovers = scheduler.drain().await;
        leftovers.extend(held);
        leftovers.extend(tasks.take_orphans());
        leftovers.extend(retry_tasks.take_orphans());
        if let Some(mut ready) = ready {
            ready.close();
            while let Ok(delivery) = ready.try_recv() {
                leftovers.push(delivery);
            }
        }

        if !leftovers.is_empty() {
            warn!(count = leftovers.len(), "Routing unfinished deliveries as dead letters");
        }
        for delivery in leftovers {
            worker.handler.abandon(delivery).await;
        }
        worker.in_flight.metrics.pending_retries(0);

        info!("Pipeline worker stopped");
        Ok(())
    }
}

/// The reading half of the worker, kept after the retry pump takes the
/// ready channel.
struct Intake<S, H> {
    source: Arc<S>,
    handler: Arc<H>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl<S, H> Intake<S, H>
where
    S: MessageSource + 'static,
    H: MessageHandler,
{
    async fn consume(
        &self,
        tasks: &mut HandlerTasks,
        shutdown: &mut watch::Receiver<bool>,
        scheduler: &RetryScheduler,
    ) {
        let claim_interval = Duration::from_millis(self.config.claim_idle_ms.max(1000));
        let mut last_claim = Instant::now();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping worker");
                break;
            }

            tasks.reap();
            self.in_flight.metrics.pending_retries(scheduler.pending());

            let batch = match self.source.receive(self.config.batch_size).await {
                Ok(batch) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Transport recovered");
                        consecutive_errors = 0;
                    }
                    batch
                }
                Err(e) if e.is_timeout() => {
                    debug!(error = %e, "Read timed out, continuing");
                    continue;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let pause = if e.is_nogroup_error() {
                        warn!("Consumer group missing, recreating");
                        if let Err(create_err) = self.source.prepare().await {
                            error!(error = %create_err, "Failed to recreate consumer group");
                        }
                        Duration::from_secs(1)
                    } else if e.is_connection_error() {
                        let backoff_secs =
                            2u64.pow(consecutive_errors.min(5)).min(MAX_BACKOFF_SECS);
                        warn!(
                            error = %e,
                            consecutive_errors,
                            backoff_secs,
                            "Transport connection error, backing off"
                        );
                        Duration::from_secs(backoff_secs)
                    } else {
                        error!(error = %e, "Failed to read batch");
                        Duration::from_secs(1)
                    };
                    if sleep_or_shutdown(pause, shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let received = batch.len();
            let mut dispatched = 0;
            for message in batch {
                if self.dispatch(tasks, message).await {
                    dispatched += 1;
                }
            }

            if last_claim.elapsed() >= claim_interval {
                match self.source.reclaim(self.config.batch_size).await {
                    Ok(claimed) => {
                        if !claimed.is_empty() {
                            self.in_flight.metrics.reclaimed(claimed.len());
                        }
                        for message in claimed {
                            self.dispatch(tasks, message).await;
                        }
                    }
                    Err(e) => debug!(error = %e, "Failed to claim abandoned entries"),
                }
                last_claim = Instant::now();
            }

            // A replay of entries that are all still in flight returns
            // immediately; pause instead of spinning on it.
            let idle = received > 0 || self.config.block_timeout_ms.is_none();
            if dispatched == 0 && idle && sleep_or_shutdown(POLL_INTERVAL, shutdown).await {
                break;
            }
        }
    }

    /// Waits for a free permit, which is what applies backpressure to reads.
    /// Returns false when the message is already being handled.
    async fn dispatch(&self, tasks: &mut HandlerTasks, message: Message) -> bool {
        let Some(claim) = self.in_flight.claim(&message.id) else {
            debug!(message_id = %message.id, "Entry already in flight, skipping redelivery");
            return false;
        };
        self.in_flight.metrics.received();

        let commit_before = self.config.commit_mode == CommitMode::Before;
        if commit_before {
            if let Err(e) = self.source.ack(&message.id).await {
                warn!(error = %e, message_id = %message.id, "Failed to acknowledge before handling");
            }
        }

        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            error!(message_id = %message.id, "Worker pool closed, leaving message pending");
            return false;
        };

        let source = self.source.clone();
        let handler = self.handler.clone();
        let in_flight = self.in_flight.clone();
        let delivery = Delivery::new(message);
        let acked = commit_before.then(|| delivery.clone());

        tasks.spawn(
            async move {
                // Dropped last, after the ack below
                let _claim = claim;
                let _permit = permit;
                let _guard = in_flight.enter();
                let id = delivery.message.id.clone();

                let outcome = handler.handle(delivery).await;
                debug!(message_id = %id, stage = %outcome.stage(), "Handled message");

                if !commit_before {
                    if let Err(e) = source.ack(&id).await {
                        warn!(error = %e, message_id = %id, "Failed to acknowledge after handling");
                    }
                }
            },
            acked,
        );
        true
    }
}

/// Feeds due retries into the pool. A permit is only taken once a retry is
/// due, so an idle pump never holds a worker slot.
async fn pump_retries<H: MessageHandler>(
    mut ready: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<H>,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
    mut shutdown: watch::Receiver<bool>,
) -> PumpState {
    let mut tasks = HandlerTasks::new();
    let mut held = None;

    loop {
        tasks.reap();

        let delivery = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            next = ready.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => {
                held = Some(delivery);
                break;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    held = Some(delivery);
                    break;
                }
            },
        };

        // The source entry was acknowledged when this retry was scheduled.
        let acked = delivery.clone();
        let handler = handler.clone();
        let in_flight = in_flight.clone();
        tasks.spawn(
            async move {
                let _permit = permit;
                let _guard = in_flight.enter();
                let id = delivery.message.id.clone();
                let outcome = handler.handle(delivery).await;
                debug!(message_id = %id, stage = %outcome.stage(), "Handled retry");
            },
            Some(acked),
        );
    }

    PumpState { ready, tasks, held }
}

/// True when shutdown was signalled during the pause.
async fn sleep_or_shutdown(pause: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => true,
        _ = tokio::time::sleep(pause) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, TransportError};
    use crate::handler::Outcome;
    use crate::persister::Ack;
    use crate::registry::StreamDef;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct Scripted;

    impl StreamDef for Scripted {
        const STREAM_NAME: &'static str = "scripted:ingest";
        const CONSUMER_GROUP: &'static str = "scripted";
        const DLQ_STREAM: &'static str = "scripted:dlq";
    }

    fn message(id: &str) -> Message {
        Message::new(id, "scripted:ingest", b"{}".to_vec())
    }

    #[derive(Default)]
    struct QueueSource {
        queue: Mutex<VecDeque<Message>>,
        acked: Mutex<Vec<String>>,
    }

    impl QueueSource {
        fn with(ids: &[&str]) -> Arc<Self> {
            let source = Self::default();
            for id in ids {
                source.queue.lock().unwrap().push_back(message(id));
            }
            Arc::new(source)
        }

        fn acked(&self) -> Vec<String> {
            self.acked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSource for QueueSource {
        fn name(&self) -> &str {
            "scripted:ingest"
        }

        async fn receive(&self, max: usize) -> Result<Vec<Message>, TransportError> {
            let mut queue = self.queue.lock().unwrap();
            let n = max.min(queue.len());
            Ok(queue.drain(..n).collect())
        }

        async fn ack(&self, id: &str) -> Result<(), TransportError> {
            self.acked.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    /// Hands back every unacknowledged entry on each read, like a consumer
    /// group replaying its pending list.
    #[derive(Default)]
    struct PendingListSource {
        pending: Mutex<Vec<Message>>,
        acked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSource for PendingListSource {
        fn name(&self) -> &str {
            "scripted:ingest"
        }

        async fn receive(&self, _max: usize) -> Result<Vec<Message>, TransportError> {
            Ok(self.pending.lock().unwrap().clone())
        }

        async fn ack(&self, id: &str) -> Result<(), TransportError> {
            self.pending.lock().unwrap().retain(|m| m.id != id);
            self.acked.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn succeeded(id: String) -> Outcome {
        Outcome::Succeeded {
            ack: Ack {
                key: id,
                created: true,
            },
            attempts: 0,
        }
    }

    fn abandoned() -> Outcome {
        Outcome::DeadLettered {
            kind: ErrorKind::TransientPersist,
            attempts: 1,
            routed: true,
        }
    }

    /// Succeeds for everything except ids starting with "retry", which are
    /// parked on the timer for an hour.
    struct ParkingHandler {
        scheduler: RetryScheduler,
        handled: Mutex<Vec<String>>,
        abandoned: Mutex<Vec<String>>,
    }

    impl ParkingHandler {
        fn new(scheduler: RetryScheduler) -> Arc<Self> {
            Arc::new(Self {
                scheduler,
                handled: Mutex::default(),
                abandoned: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for ParkingHandler {
        async fn handle(&self, delivery: Delivery) -> Outcome {
            let id = delivery.message.id.clone();
            self.handled.lock().unwrap().push(id.clone());
            if id.starts_with("retry") {
                let delay = Duration::from_secs(3600);
                let _ = self.scheduler.schedule(delivery, delay);
                return Outcome::RetryScheduled { attempts: 1, delay };
            }
            succeeded(id)
        }

        async fn abandon(&self, delivery: Delivery) -> Outcome {
            self.abandoned.lock().unwrap().push(delivery.message.id);
            abandoned()
        }
    }

    /// Takes `work` per call; first attempts schedule a retry due in one
    /// second when `retry_once` is set.
    struct SlowHandler {
        scheduler: RetryScheduler,
        work: Duration,
        retry_once: bool,
        handled: Mutex<Vec<(String, u32)>>,
        abandoned: Mutex<Vec<(String, u32)>>,
    }

    impl SlowHandler {
        fn new(scheduler: RetryScheduler, work: Duration, retry_once: bool) -> Arc<Self> {
            Arc::new(Self {
                scheduler,
                work,
                retry_once,
                handled: Mutex::default(),
                abandoned: Mutex::default(),
            })
        }

        fn handled(&self) -> Vec<(String, u32)> {
            self.handled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, mut delivery: Delivery) -> Outcome {
            let id = delivery.message.id.clone();
            let attempts = delivery.state.attempts;
            self.handled.lock().unwrap().push((id.clone(), attempts));

            if self.retry_once && attempts == 0 {
                delivery.state.attempts = 1;
                delivery.state.last_error = Some("socket closed".into());
                let delay = Duration::from_secs(1);
                let _ = self.scheduler.schedule(delivery, delay);
                return Outcome::RetryScheduled { attempts: 1, delay };
            }

            tokio::time::sleep(self.work).await;
            succeeded(id)
        }

        async fn abandon(&self, delivery: Delivery) -> Outcome {
            self.abandoned
                .lock()
                .unwrap()
                .push((delivery.message.id, delivery.state.attempts));
            abandoned()
        }
    }

    fn config(mode: CommitMode, concurrency: usize) -> WorkerConfig {
        WorkerConfig::from_stream_def::<Scripted>()
            .with_block_timeout_ms(None)
            .with_max_concurrent_jobs(concurrency)
            .with_commit_mode(mode)
    }

    async fn run_until_acked<H: MessageHandler>(
        source: Arc<QueueSource>,
        handler: Arc<H>,
        scheduler: RetryScheduler,
        ready: mpsc::UnboundedReceiver<Delivery>,
        config: WorkerConfig,
        expected_acks: usize,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = PipelineWorker::new(source.clone(), handler, scheduler, ready, config);
        let running = tokio::spawn(worker.run(shutdown_rx));

        while source.acked().len() < expected_acks {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_every_message_after_handling() {
        let (scheduler, ready) = RetryScheduler::spawn();
        let source = QueueSource::with(&["1-0", "2-0", "3-0"]);
        let handler = ParkingHandler::new(scheduler.clone());

        run_until_acked(
            source.clone(),
            handler.clone(),
            scheduler,
            ready,
            config(CommitMode::After, 2),
            3,
        )
        .await;

        let mut acked = source.acked();
        acked.sort();
        assert_eq!(acked, vec!["1-0", "2-0", "3-0"]);
        assert_eq!(handler.handled.lock().unwrap().len(), 3);
        assert!(handler.abandoned.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_slot_is_not_held_by_idle_retry_pump() {
        let (scheduler, ready) = RetryScheduler::spawn();
        let source = QueueSource::with(&["1-0", "2-0", "3-0"]);
        let handler = ParkingHandler::new(scheduler.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = PipelineWorker::new(
            source.clone(),
            handler.clone(),
            scheduler,
            ready,
            config(CommitMode::After, 1),
        );
        let running = tokio::spawn(worker.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.acked().len(), 3);
        assert_eq!(handler.handled.lock().unwrap().len(), 3);

        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_slot_runs_due_retries_and_new_messages() {
        let (scheduler, ready) = RetryScheduler::spawn();
        let source = QueueSource::with(&["1-0", "2-0", "3-0"]);
        let handler = SlowHandler::new(scheduler.clone(), Duration::from_millis(50), true);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = PipelineWorker::new(
            source.clone(),
            handler.clone(),
            scheduler,
            ready,
            config(CommitMode::After, 1),
        );
        let running = tokio::spawn(worker.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(60)).await;
        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();

        let mut handled = handler.handled();
        handled.sort();
        assert_eq!(
            handled,
            vec![
                ("1-0".to_string(), 0),
                ("1-0".to_string(), 1),
                ("2-0".to_string(), 0),
                ("2-0".to_string(), 1),
                ("3-0".to_string(), 0),
                ("3-0".to_string(), 1),
            ]
        );
        assert!(handler.abandoned.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_entry_is_not_handled_while_in_flight() {
        let (scheduler, ready) = RetryScheduler::spawn();
        let source = Arc::new(PendingListSource::default());
        source.pending.lock().unwrap().push(message("1-0"));
        let handler = SlowHandler::new(scheduler.clone(), Duration::from_millis(2_500), false);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = PipelineWorker::new(
            source.clone(),
            handler.clone(),
            scheduler,
            ready,
            config(CommitMode::After, 4),
        );
        let running = tokio::spawn(worker.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handler.handled(), vec![("1-0".to_string(), 0)]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*source.acked.lock().unwrap(), vec!["1-0"]);
        assert_eq!(handler.handled().len(), 1);

        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_routes_pending_retries() {
        let (scheduler, ready) = RetryScheduler::spawn();
        let source = QueueSource::with(&["retry-1", "ok-1", "retry-2"]);
        let handler = ParkingHandler::new(scheduler.clone());

        run_until_acked(
            source.clone(),
            handler.clone(),
            scheduler.clone(),
            ready,
            config(CommitMode::Before, 2),
            3,
        )
        .await;

        let mut abandoned = handler.abandoned.lock().unwrap().clone();
        abandoned.sort();
        assert_eq!(abandoned, vec!["retry-1", "retry-2"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cut_off_by_shutdown_timeout_is_routed() {
        let (scheduler, ready) = RetryScheduler::spawn();
        let source = QueueSource::with(&["1-0"]);
        let handler = SlowHandler::new(scheduler.clone(), Duration::from_secs(3600), true);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = PipelineWorker::new(
            source.clone(),
            handler.clone(),
            scheduler,
            ready,
            config(CommitMode::After, 2).with_shutdown_timeout(Duration::from_secs(5)),
        );
        let running = tokio::spawn(worker.run(shutdown_rx));

        // First attempt schedules the retry and is acked; the retry then runs
        // far past the shutdown timeout.
        while handler.handled().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(source.acked(), vec!["1-0"]);

        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(
            *handler.abandoned.lock().unwrap(),
            vec![("1-0".to_string(), 1)]
        );
    }
}
