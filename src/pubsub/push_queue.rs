//! Time-ordered queue of pending push deliveries.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::types::{Message, MessageId, SubscriptionConfig};

/// One message bound for one push subscription.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    /// The message to deliver.
    pub message: Message,
    /// Subscription config as of publish time.
    pub subscription: Arc<SubscriptionConfig>,
    /// Failed attempts so far (0 for the first try).
    pub attempt: u32,
    /// Not before this instant.
    pub scheduled_time: Instant,
}

impl DeliveryTask {
    /// A first attempt, due now.
    pub fn new(message: Message, subscription: Arc<SubscriptionConfig>) -> Self {
        Self {
            message,
            subscription,
            attempt: 0,
            scheduled_time: Instant::now(),
        }
    }

    /// The slot this delivery is serialized on, when the subscription is
    /// ordered and the message carries a key.
    pub fn ordering_slot(&self) -> Option<OrderingSlot> {
        if !self.subscription.enable_message_ordering {
            return None;
        }
        self.message
            .ordering_key
            .as_ref()
            .map(|key| (self.subscription.name.clone(), key.clone()))
    }

    /// The same delivery, one attempt later and due after `delay`.
    pub fn retry_after(mut self, delay: Duration) -> Self {
        self.attempt += 1;
        self.scheduled_time = Instant::now() + delay;
        self
    }
}

/// Heap entry; ties on time fall back to enqueue order.
struct Scheduled {
    seq: u64,
    task: DeliveryTask,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: earliest time, then lowest seq, wins.
        other
            .task
            .scheduled_time
            .cmp(&self.task.scheduled_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Subscription and ordering key a push delivery is serialized on.
pub type OrderingSlot = (String, String);

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Scheduled>,
    /// Ordering slots with a message in flight or awaiting retry.
    held: HashMap<OrderingSlot, MessageId>,
}

impl QueueState {
    fn is_blocked(&self, task: &DeliveryTask) -> bool {
        task.ordering_slot()
            .and_then(|slot| self.held.get(&slot))
            .is_some_and(|holder| *holder != task.message.id)
    }

    /// Time until the earliest task that is not waiting on its ordering key.
    fn next_wait(&self) -> Option<Duration> {
        let now = Instant::now();
        self.heap
            .iter()
            .filter(|s| !self.is_blocked(&s.task))
            .map(|s| s.task.scheduled_time.saturating_duration_since(now))
            .min()
    }
}

/// Shared delivery queue. Clones refer to the same queue.
///
/// Tasks of a subscription with message ordering enabled are handed out one
/// at a time per ordering key: the next one waits until the worker holding
/// the key calls [`release`](DeliveryQueue::release).
#[derive(Clone)]
pub struct DeliveryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    next_seq: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl DeliveryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add a task and wake one waiting worker.
    pub async fn enqueue(&self, task: DeliveryTask) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.state.lock().await.heap.push(Scheduled { seq, task });
        self.notify.notify_one();
    }

    /// Pop the earliest due task whose ordering key is free, taking the key.
    pub async fn dequeue_ready(&self) -> Option<DeliveryTask> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut blocked = Vec::new();
        let mut ready = None;

        while state.heap.peek().is_some_and(|next| next.task.scheduled_time <= now) {
            let Some(next) = state.heap.pop() else {
                break;
            };
            if state.is_blocked(&next.task) {
                blocked.push(next);
                continue;
            }
            if let Some(slot) = next.task.ordering_slot() {
                state.held.insert(slot, next.task.message.id.clone());
            }
            ready = Some(next.task);
            break;
        }

        state.heap.extend(blocked);
        ready
    }

    /// Free an ordering key once its message is acked, dead-lettered or dropped.
    pub async fn release(&self, slot: Option<OrderingSlot>) {
        let Some(slot) = slot else {
            return;
        };
        if self.state.lock().await.held.remove(&slot).is_some() {
            self.notify.notify_waiters();
        }
    }

    /// Wait until a task is due and pop it. Returns `None` once the queue is closed.
    pub async fn wait_and_dequeue(&self) -> Option<DeliveryTask> {
        loop {
            // Register before checking so a close or release in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(task) = self.dequeue_ready().await {
                return Some(task);
            }

            let wait = self.state.lock().await.next_wait();
            match wait {
                Some(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stop handing out tasks and wake every waiter.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    /// Number of queued tasks, due or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    /// Whether nothing is queued.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.heap.is_empty()
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}
