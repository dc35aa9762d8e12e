//! In-process timer queue for delayed retries
//!
//! One task owns a min-heap of pending deliveries keyed by due time. Due
//! deliveries are pushed onto the ready channel, which the worker drains
//! into its pool like any other unit of work. Nothing ever sleeps on a
//! worker permit.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::handler::Delivery;

struct Entry {
    due: Instant,
    seq: u64,
    delivery: Delivery,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Handle to the timer task. Cheap to clone.
#[derive(Clone)]
pub struct RetryScheduler {
    schedule_tx: mpsc::UnboundedSender<(Delivery, Instant)>,
    drain_tx: mpsc::UnboundedSender<oneshot::Sender<Vec<Delivery>>>,
    pending: Arc<AtomicUsize>,
}

impl RetryScheduler {
    /// Start the timer task. The returned receiver yields deliveries as they
    /// come due.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let (drain_tx, drain_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_timer(schedule_rx, drain_rx, ready_tx, pending.clone()));

        let scheduler = Self {
            schedule_tx,
            drain_tx,
            pending,
        };
        (scheduler, ready_rx)
    }

    /// Queue `delivery` to come due after `delay`. Hands the delivery back if
    /// the timer task has already been drained.
    pub fn schedule(&self, delivery: Delivery, delay: Duration) -> Result<(), Delivery> {
        let due = Instant::now() + delay;
        self.schedule_tx
            .send((delivery, due))
            .map_err(|returned| returned.0.0)
    }

    /// Deliveries waiting on their timer
    pub fn pending(&self) -> usize {
        self.pending.load(AtomicOrdering::Relaxed)
    }

    /// Stop the timer task and take everything still waiting, earliest first.
    /// Subsequent [`Self::schedule`] calls fail.
    pub async fn drain(&self) -> Vec<Delivery> {
        let (reply, rx) = oneshot::channel();
        if self.drain_tx.send(reply).is_err() {
            return vec![];
        }
        rx.await.unwrap_or_default()
    }
}

async fn run_timer(
    mut schedule_rx: mpsc::UnboundedReceiver<(Delivery, Instant)>,
    mut drain_rx: mpsc::UnboundedReceiver<oneshot::Sender<Vec<Delivery>>>,
    ready: mpsc::UnboundedSender<Delivery>,
    pending: Arc<AtomicUsize>,
) {
    let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
    let mut seq: u64 = 0;
    let mut ready_closed = false;

    loop {
        let next_due = if ready_closed {
            None
        } else {
            heap.peek().map(|Reverse(e)| e.due)
        };
        let timer = async move {
            match next_due {
                Some(due) => sleep_until(due).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            scheduled = schedule_rx.recv() => match scheduled {
                Some((delivery, due)) => {
                    seq += 1;
                    heap.push(Reverse(Entry { due, seq, delivery }));
                    pending.store(heap.len(), AtomicOrdering::Relaxed);
                }
                None => {
                    if !heap.is_empty() {
                        warn!(count = heap.len(), "Retry scheduler dropped with pending retries");
                    }
                    return;
                }
            },
            Some(reply) = drain_rx.recv() => {
                // Schedules sent before the drain request must not be lost
                schedule_rx.close();
                while let Ok((delivery, due)) = schedule_rx.try_recv() {
                    seq += 1;
                    heap.push(Reverse(Entry { due, seq, delivery }));
                }
                let drained: Vec<Delivery> = heap
                    .into_sorted_vec()
                    .into_iter()
                    .rev()
                    .map(|Reverse(e)| e.delivery)
                    .collect();
                pending.store(0, AtomicOrdering::Relaxed);
                debug!(count = drained.len(), "Retry queue drained");
                let _ = reply.send(drained);
                return;
            },
            _ = timer => {
                let now = Instant::now();
                while heap.peek().is_some_and(|Reverse(e)| e.due <= now) {
                    let Some(Reverse(entry)) = heap.pop() else { break };
                    if let Err(returned) = ready.send(entry.delivery) {
                        // Consumer side is gone; keep it for drain
                        heap.push(Reverse(Entry {
                            due: entry.due,
                            seq: entry.seq,
                            delivery: returned.0,
                        }));
                        ready_closed = true;
                        break;
                    }
                }
                pending.store(heap.len(), AtomicOrdering::Relaxed);
            }
        }
    }
}
