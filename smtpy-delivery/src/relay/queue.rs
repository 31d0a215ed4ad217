//! Bounded priority queue feeding the relay workers
//!
//! Ready items are ordered by priority, then by arrival. Items waiting out a
//! retry backoff are parked separately and promoted once due, so a delayed
//! high-priority item never blocks ready work behind it.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    sync::Arc,
};

use parking_lot::Mutex;
use smtpy_common::Message;
use tokio::{
    sync::{Notify, oneshot},
    time::Instant,
};

use crate::types::{DeliveryAttempt, DeliveryOutcome, DeliveryStatus, Priority};

/// Per-recipient results delivered to whoever enqueued the item.
pub type RelayResult = HashMap<String, DeliveryOutcome>;

/// One message with its outstanding recipients.
#[derive(Debug)]
pub struct QueueItem {
    pub message: Arc<Message>,
    /// Rendered once at enqueue.
    pub data: Arc<[u8]>,
    pub mail_from: String,
    /// Recipients still awaiting a final outcome.
    pub pending: Vec<String>,
    pub priority: Priority,
    pub seq: u64,
    pub enqueued_at: Instant,
    /// Delivery attempts made so far. Rate-limit requeues do not count.
    pub attempts: u32,
    pub next_attempt_at: Instant,
    pub history: HashMap<String, Vec<DeliveryAttempt>>,
    pub outcomes: RelayResult,
    result: Option<oneshot::Sender<RelayResult>>,
}

impl QueueItem {
    pub fn new(
        message: Arc<Message>,
        recipients: Vec<String>,
        mail_from: String,
        priority: Priority,
    ) -> (Self, oneshot::Receiver<RelayResult>) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let data = Arc::from(message.to_bytes());

        let mut pending: Vec<String> = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            if !pending.contains(&recipient) {
                pending.push(recipient);
            }
        }

        let item = Self {
            message,
            data,
            mail_from,
            pending,
            priority,
            seq: 0,
            enqueued_at: now,
            attempts: 0,
            next_attempt_at: now,
            history: HashMap::new(),
            outcomes: HashMap::new(),
            result: Some(tx),
        };
        (item, rx)
    }

    /// Record an attempt for `recipient`.
    pub fn record(&mut self, recipient: &str, attempt: DeliveryAttempt) {
        self.history
            .entry(recipient.to_string())
            .or_default()
            .push(attempt);
    }

    /// Move `recipient` out of `pending` with its final outcome.
    pub fn finish(&mut self, recipient: &str, status: DeliveryStatus) {
        self.pending.retain(|r| r != recipient);
        let attempts = self.history.remove(recipient).unwrap_or_default();
        self.outcomes.insert(
            recipient.to_string(),
            DeliveryOutcome::from_attempts(recipient, status, attempts),
        );
    }

    /// Hand the outcomes to the waiting caller. A caller that stopped
    /// listening is not an error.
    pub fn resolve(mut self) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(std::mem::take(&mut self.outcomes));
        }
    }
}

struct Ready(QueueItem);

impl Ready {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.0.priority, Reverse(self.0.seq))
    }
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct State {
    ready: BinaryHeap<Ready>,
    delayed: Vec<QueueItem>,
    next_seq: u64,
    closed: bool,
}

impl State {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].next_attempt_at <= now {
                let item = self.delayed.swap_remove(index);
                self.ready.push(Ready(item));
            } else {
                index += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|item| item.next_attempt_at).min()
    }

    fn insert(&mut self, item: QueueItem) {
        if item.next_attempt_at > Instant::now() {
            self.delayed.push(item);
        } else {
            self.ready.push(Ready(item));
        }
    }
}

/// Why an item was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

pub struct RelayQueue {
    state: Mutex<State>,
    capacity: usize,
    notify: Notify,
}

impl std::fmt::Debug for RelayQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl RelayQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            capacity,
            notify: Notify::new(),
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    /// Admit a new item, assigning its sequence number.
    ///
    /// # Errors
    ///
    /// Refuses the item when the queue is full or closed.
    pub fn push(&self, mut item: QueueItem) -> Result<(), PushError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PushError::Closed);
            }
            if state.len() >= self.capacity {
                return Err(PushError::Full);
            }
            item.seq = state.next_seq;
            state.next_seq += 1;
            state.insert(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Put an already admitted item back. Capacity is not checked and a
    /// closed queue still accepts it, so draining can finish its retries.
    pub fn requeue(&self, item: QueueItem) {
        self.state.lock().insert(item);
        self.notify.notify_one();
    }

    /// Wait for the highest priority ready item. Returns `None` once the
    /// queue is closed and empty.
    pub async fn next_ready(&self) -> Option<QueueItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                state.promote_due(Instant::now());

                if let Some(Ready(item)) = state.ready.pop() {
                    return Some(item);
                }
                if state.closed && state.delayed.is_empty() {
                    return None;
                }
                state.next_due()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stop admitting new items and wake every waiting worker.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    /// Remove every remaining item, ready or delayed.
    pub fn drain(&self) -> Vec<QueueItem> {
        let mut state = self.state.lock();
        let mut items: Vec<QueueItem> = state.ready.drain().map(|Ready(item)| item).collect();
        items.append(&mut state.delayed);
        items
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use smtpy_common::MessageBuilder;

    use super::*;

    fn item(priority: Priority) -> QueueItem {
        let message = MessageBuilder::new()
            .from("a@example.com")
            .to("b@example.com")
            .subject(priority.to_string())
            .body("x")
            .build()
            .unwrap();
        QueueItem::new(
            Arc::new(message),
            vec!["b@example.com".to_string()],
            "a@example.com".to_string(),
            priority,
        )
        .0
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = RelayQueue::new(10);
        for priority in [Priority::Low, Priority::High, Priority::Normal, Priority::High] {
            queue.push(item(priority)).unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..4 {
            let next = queue.next_ready().await.unwrap();
            order.push((next.priority, next.seq));
        }

        assert_eq!(
            order,
            vec![
                (Priority::High, 1),
                (Priority::High, 3),
                (Priority::Normal, 2),
                (Priority::Low, 0),
            ]
        );
    }

    #[test]
    fn test_capacity() {
        let queue = RelayQueue::new(2);
        assert!(queue.push(item(Priority::Normal)).is_ok());
        assert!(queue.push(item(Priority::Normal)).is_ok());
        assert!(matches!(
            queue.push(item(Priority::Normal)),
            Err(PushError::Full)
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_closed_refuses_push_but_accepts_requeue() {
        let queue = RelayQueue::new(2);
        queue.close();
        assert!(matches!(
            queue.push(item(Priority::Normal)),
            Err(PushError::Closed)
        ));

        queue.requeue(item(Priority::Normal));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_and_empty_returns_none() {
        let queue = RelayQueue::new(2);
        queue.close();
        assert!(queue.next_ready().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_item_does_not_block_ready_items() {
        let queue = RelayQueue::new(10);
        let mut delayed = item(Priority::High);
        delayed.next_attempt_at = Instant::now() + Duration::from_secs(5);
        queue.requeue(delayed);
        queue.push(item(Priority::Low)).unwrap();

        let first = queue.next_ready().await.unwrap();
        assert_eq!(first.priority, Priority::Low);

        let started = Instant::now();
        let second = queue.next_ready().await.unwrap();
        assert_eq!(second.priority, Priority::High);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_worker() {
        let queue = Arc::new(RelayQueue::new(2));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next_ready().await.is_none() })
        };

        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_duplicate_recipients_collapsed() {
        let message = MessageBuilder::new()
            .from("a@example.com")
            .to("b@example.com")
            .body("x")
            .build()
            .unwrap();
        let (item, _rx) = QueueItem::new(
            Arc::new(message),
            vec!["b@example.com".to_string(), "b@example.com".to_string()],
            "a@example.com".to_string(),
            Priority::Normal,
        );
        assert_eq!(item.pending.len(), 1);
    }
}
