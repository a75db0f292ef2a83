//! Bounded byte-accounted FIFO used by connection writers.
//!
//! The queue holds already-encoded frames. Producers are any tasks that
//! fan out publications; the single consumer is the connection's writer
//! loop blocking on [`Queue::wait`].

use crate::types::ChannelId;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// One queued frame.
#[derive(Debug, Clone)]
pub struct Item {
    /// Encoded frame data.
    pub data: Bytes,
    /// Source channel; empty for frames not tied to a channel.
    pub channel: ChannelId,
}

impl Item {
    /// Create an item for a channel frame.
    #[must_use]
    pub fn new(data: Bytes, channel: impl Into<ChannelId>) -> Self {
        Self {
            data,
            channel: channel.into(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<Item>,
    size: usize,
    closed: bool,
}

/// An unbounded-in-structure, caller-bounded-in-bytes FIFO.
///
/// The queue itself never rejects on size; callers check [`Queue::size`]
/// after adding and act on their own limit, which keeps the slow-client
/// policy out of the data structure.
#[derive(Debug, Default)]
pub struct Queue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Queue {
    /// Create an empty open queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item. Returns `false` if the queue is closed.
    pub fn add(&self, item: Item) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            inner.size += item.data.len();
            inner.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Remove the head item without blocking.
    pub fn remove(&self) -> Option<Item> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.items.pop_front()?;
        inner.size -= item.data.len();
        Some(item)
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is closed and fully drained; items
    /// enqueued before `close` are still handed out.
    pub async fn wait(&self) -> Option<Item> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.pop_front() {
                    inner.size -= item.data.len();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Total bytes currently queued.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().size
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// Whether the queue holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Close the queue. Idempotent; wakes all waiters.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn item(data: &[u8]) -> Item {
        Item::new(Bytes::copy_from_slice(data), "")
    }

    #[test]
    fn test_add_remove_size() {
        let q = Queue::new();
        assert!(q.add(item(b"abc")));
        assert!(q.add(item(b"de")));
        assert_eq!(q.len(), 2);
        assert_eq!(q.size(), 5);

        let first = q.remove().unwrap();
        assert_eq!(&first.data[..], b"abc");
        assert_eq!(q.size(), 2);
        assert!(q.remove().is_some());
        assert!(q.remove().is_none());
    }

    #[test]
    fn test_add_after_close_rejected() {
        let q = Queue::new();
        q.close();
        q.close();
        assert!(!q.add(item(b"late")));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_add() {
        let q = Arc::new(Queue::new());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(q.add(item(b"x")));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(&got.data[..], b"x");
    }

    #[tokio::test]
    async fn test_wait_drains_then_ends_after_close() {
        let q = Queue::new();
        q.add(item(b"1"));
        q.add(item(b"2"));
        q.close();
        assert!(q.wait().await.is_some());
        assert!(q.wait().await.is_some());
        assert!(q.wait().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let q = Arc::new(Queue::new());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_producers() {
        let q = Arc::new(Queue::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    assert!(q.add(item(b"data")));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(q.len(), 400);
        assert_eq!(q.size(), 1600);
    }
}
