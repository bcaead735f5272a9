use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::warn;
use tradegate_core::{Result, TradeGateError};

/// What a stream queue does when a consumer falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Never drops. A slow consumer grows memory instead.
    #[default]
    Unbounded,
    /// Keeps at most `capacity` items, discarding the oldest.
    DropOldest { capacity: usize },
}

impl QueuePolicy {
    pub fn from_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(capacity) if capacity > 0 => QueuePolicy::DropOldest { capacity },
            _ => QueuePolicy::Unbounded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Closed locally by the consumer.
    Closed,
    /// The server closed the connection cleanly.
    Ended,
    /// The connection failed.
    Failed(String),
}

impl Termination {
    fn to_error(&self) -> TradeGateError {
        match self {
            Termination::Closed => TradeGateError::SubscriptionState("stream is closed".to_string()),
            Termination::Ended => TradeGateError::StreamEnded,
            Termination::Failed(reason) => TradeGateError::ConnectionLost(reason.clone()),
        }
    }
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    terminated: Option<Termination>,
    dropped: u64,
}

/// Per-consumer buffer between a connection actor and a stream reader.
#[derive(Debug)]
pub struct StreamQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    policy: QueuePolicy,
}

impl<T> StreamQueue<T> {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                terminated: None,
                dropped: 0,
            }),
            notify: Notify::new(),
            policy,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(QueuePolicy::Unbounded)
    }

    /// Returns false if the queue is already terminated and the item was
    /// discarded.
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            if state.terminated.is_some() {
                return false;
            }

            if let QueuePolicy::DropOldest { capacity } = self.policy {
                while state.items.len() >= capacity {
                    state.items.pop_front();
                    state.dropped += 1;
                    if state.dropped == 1 || state.dropped % 1000 == 0 {
                        warn!(dropped = state.dropped, capacity, "Stream consumer lagging, dropping oldest items");
                    }
                }
            }

            state.items.push_back(item);
        }
        self.notify.notify_waiters();
        true
    }

    /// Ends the queue. Items already queued are still readable. The first
    /// termination wins.
    pub fn terminate(&self, reason: Termination) {
        {
            let mut state = self.state.lock();
            if state.terminated.is_none() {
                state.terminated = Some(reason);
            }
        }
        self.notify.notify_waiters();
    }

    /// Local close: discards pending items and fails later reads.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.items.clear();
            state.terminated = Some(Termination::Closed);
        }
        self.notify.notify_waiters();
    }

    /// Waits for the next item. Cancel-safe: an item is only removed when
    /// it is returned.
    pub async fn pop(&self) -> Result<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Ok(item);
                }
                if let Some(reason) = &state.terminated {
                    return Err(reason.to_error());
                }
            }

            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn termination(&self) -> Option<Termination> {
        self.state.lock().terminated.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_items_are_read_in_order() {
        let queue = StreamQueue::unbounded();
        for i in 0..5 {
            assert!(queue.push(i));
        }
        for i in 0..5 {
            assert_eq!(queue.pop().await.unwrap(), i);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(StreamQueue::unbounded());
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("late");
        assert_eq!(reader.await.unwrap().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_queued_items_survive_termination() {
        let queue = StreamQueue::unbounded();
        queue.push(1);
        queue.push(2);
        queue.terminate(Termination::Failed("reset".to_string()));

        assert!(!queue.push(3));
        assert_eq!(queue.pop().await.unwrap(), 1);
        assert_eq!(queue.pop().await.unwrap(), 2);
        assert!(matches!(queue.pop().await, Err(TradeGateError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_termination_wakes_reader() {
        let queue = Arc::new(StreamQueue::<u32>::unbounded());
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.terminate(Termination::Ended);
        assert!(matches!(reader.await.unwrap(), Err(TradeGateError::StreamEnded)));
    }

    #[tokio::test]
    async fn test_close_discards_items() {
        let queue = StreamQueue::unbounded();
        queue.push(1);
        queue.close();

        assert!(matches!(queue.pop().await, Err(TradeGateError::SubscriptionState(_))));
        assert_eq!(queue.termination(), Some(Termination::Closed));
    }

    #[tokio::test]
    async fn test_close_overrides_connection_termination() {
        let queue = StreamQueue::<u32>::unbounded();
        queue.terminate(Termination::Ended);
        queue.close();
        assert!(matches!(queue.pop().await, Err(TradeGateError::SubscriptionState(_))));
    }

    #[tokio::test]
    async fn test_drop_oldest_counts_drops() {
        let queue = StreamQueue::new(QueuePolicy::DropOldest { capacity: 3 });
        for i in 0..10 {
            queue.push(i);
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 7);
        assert_eq!(queue.pop().await.unwrap(), 7);
        assert_eq!(queue.pop().await.unwrap(), 8);
        assert_eq!(queue.pop().await.unwrap(), 9);
    }

    #[test]
    fn test_policy_from_capacity() {
        assert_eq!(QueuePolicy::from_capacity(None), QueuePolicy::Unbounded);
        assert_eq!(QueuePolicy::from_capacity(Some(0)), QueuePolicy::Unbounded);
        assert_eq!(
            QueuePolicy::from_capacity(Some(64)),
            QueuePolicy::DropOldest { capacity: 64 }
        );
    }
}
