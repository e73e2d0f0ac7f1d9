//! Ready list driving the muxer's write loop
//!
//! A bounded FIFO of stream IDs with pending output. Enqueueing an ID that
//! is already queued is a no-op, so the list holds at most one entry per
//! stream and the write loop visits ready streams round-robin.

use edgelink_proto::StreamId;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::warn;

pub struct ReadyList {
    inner: Mutex<ReadyInner>,
    notify: Notify,
    capacity: usize,
}

struct ReadyInner {
    queue: VecDeque<StreamId>,
    queued: HashSet<StreamId>,
    closed: bool,
}

impl ReadyList {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ReadyInner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Signal that a stream has pending output. Duplicate signals coalesce.
    /// Returns false when the list is closed or full; with capacity equal to
    /// the muxer's stream limit, full can only mean a stream-accounting bug.
    pub fn enqueue(&self, id: StreamId) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            if inner.queued.contains(&id) {
                return true;
            }
            if inner.queue.len() >= self.capacity {
                warn!(stream_id = id, "ready list full, dropping wakeup");
                return false;
            }
            inner.queued.insert(id);
            inner.queue.push_back(id);
        }
        self.notify.notify_one();
        true
    }

    /// Take the next ready stream ID, suspending while the list is empty.
    /// Returns `None` once the list closes and drains.
    pub async fn dequeue(&self) -> Option<StreamId> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(id) = inner.queue.pop_front() {
                    inner.queued.remove(&id);
                    return Some(id);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the list; the write loop drains remaining entries and exits.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let list = ReadyList::new(8);
        list.enqueue(3);
        list.enqueue(1);
        list.enqueue(5);

        assert_eq!(list.dequeue().await, Some(3));
        assert_eq!(list.dequeue().await, Some(1));
        assert_eq!(list.dequeue().await, Some(5));
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_coalesces() {
        let list = ReadyList::new(8);
        list.enqueue(7);
        list.enqueue(7);
        list.enqueue(7);

        assert_eq!(list.len(), 1);
        assert_eq!(list.dequeue().await, Some(7));
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_after_dequeue() {
        let list = ReadyList::new(8);
        list.enqueue(9);
        assert_eq!(list.dequeue().await, Some(9));
        assert!(list.enqueue(9));
        assert_eq!(list.dequeue().await, Some(9));
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let list = Arc::new(ReadyList::new(8));

        let consumer = {
            let list = list.clone();
            tokio::spawn(async move { list.dequeue().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        list.enqueue(11);
        assert_eq!(consumer.await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let list = ReadyList::new(8);
        list.enqueue(2);
        list.close();

        assert_eq!(list.dequeue().await, Some(2));
        assert_eq!(list.dequeue().await, None);
        assert!(!list.enqueue(4));
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let list = ReadyList::new(2);
        assert!(list.enqueue(1));
        assert!(list.enqueue(2));
        assert!(!list.enqueue(3));
    }
}
