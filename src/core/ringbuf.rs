use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Bounded queue decoupling the path-side dispatcher from the socket
/// writer of a reader connection.
///
/// `push` never blocks: when the buffer is full the oldest entry is
/// overwritten, trading stale media for producer liveness. `pull` waits
/// until an item arrives or the buffer is closed; after `close` every
/// waiter observes `None` exactly once.
#[derive(Debug)]
pub struct RingBuffer<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

#[derive(Debug)]
struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an item, overwriting the oldest entry when full.
    pub fn push(&self, item: T) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed {
                return;
            }
            if inner.queue.len() == self.capacity {
                inner.queue.pop_front();
            }
            inner.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the buffer is closed.
    pub async fn pull(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking state so a concurrent close or push
            // cannot slip between the check and the await
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if inner.closed {
                    return None;
                }
                if let Some(item) = inner.queue.pop_front() {
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Close the buffer and wake every waiter. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.queue.clear();
        }
        self.notify.notify_waiters();
        // a consumer between lock release and notified() registration still
        // sees the closed flag; a stored permit covers the remaining race
        self.notify.notify_one();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn pull_returns_items_in_order() {
        let rb = RingBuffer::new(4);
        rb.push(1);
        rb.push(2);
        assert_eq!(rb.pull().await, Some(1));
        assert_eq!(rb.pull().await, Some(2));
    }

    #[tokio::test]
    async fn full_buffer_drops_oldest() {
        let rb = RingBuffer::new(2);
        rb.push(1);
        rb.push(2);
        rb.push(3);
        assert_eq!(rb.pull().await, Some(2));
        assert_eq!(rb.pull().await, Some(3));
    }

    #[tokio::test]
    async fn close_wakes_blocked_puller() {
        let rb = Arc::new(RingBuffer::<i32>::new(4));

        let puller = {
            let rb = rb.clone();
            tokio::spawn(async move { rb.pull().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        rb.close();

        let pulled = tokio::time::timeout(Duration::from_secs(1), puller)
            .await
            .expect("puller did not wake")
            .unwrap();
        assert_eq!(pulled, None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_sticky() {
        let rb: RingBuffer<u8> = RingBuffer::new(4);
        rb.close();
        rb.close();
        assert_eq!(rb.pull().await, None);
        rb.push(1);
        assert_eq!(rb.pull().await, None);
    }

    #[tokio::test]
    async fn push_wakes_waiting_puller() {
        let rb = Arc::new(RingBuffer::new(4));

        let puller = {
            let rb = rb.clone();
            tokio::spawn(async move { rb.pull().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        rb.push(7);

        let pulled = tokio::time::timeout(Duration::from_secs(1), puller)
            .await
            .expect("puller did not wake")
            .unwrap();
        assert_eq!(pulled, Some(7));
    }
}
