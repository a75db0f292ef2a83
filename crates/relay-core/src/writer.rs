//! Per-connection write path.
//!
//! A `Writer` owns the connection's bounded queue. Producers enqueue
//! encoded frames; the single writer loop waits on the queue,
//! opportunistically drains a few more frames, and hands the batch to
//! the transport as one write.

use crate::errors::Disconnect;
use crate::queue::{Item, Queue};
use crate::transport::{Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Per-connection writer with a byte-bounded queue.
#[derive(Debug)]
pub struct Writer {
    queue: Queue,
    max_queue_size: usize,
    max_messages_in_frame: usize,
    write_timeout: Duration,
}

impl Writer {
    /// Create a writer.
    ///
    /// `max_queue_size` of zero disables the slow-client limit;
    /// `write_timeout` of zero disables the per-write deadline.
    #[must_use]
    pub fn new(max_queue_size: usize, max_messages_in_frame: usize, write_timeout: Duration) -> Self {
        Self {
            queue: Queue::new(),
            max_queue_size,
            max_messages_in_frame: max_messages_in_frame.max(1),
            write_timeout,
        }
    }

    /// Enqueue a frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns a `slow` disconnect when the queue exceeds its byte
    /// limit, or a `normal` disconnect when the queue is already closed.
    pub fn enqueue(&self, item: Item) -> Result<(), Disconnect> {
        if !self.queue.add(item) {
            return Err(Disconnect::normal());
        }
        if self.max_queue_size > 0 && self.queue.size() > self.max_queue_size {
            // Closing the queue makes the writer loop drain and exit.
            self.queue.close();
            return Err(Disconnect::slow());
        }
        Ok(())
    }

    /// Bytes currently queued.
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.queue.size()
    }

    /// Run the writer loop until the queue closes or a write fails.
    ///
    /// # Errors
    ///
    /// Returns the transport error that terminated the loop.
    pub async fn run(&self, transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        while let Some(item) = self.queue.wait().await {
            let mut frames = Vec::with_capacity(1);
            frames.push(item.data);
            while frames.len() < self.max_messages_in_frame {
                match self.queue.remove() {
                    Some(next) => frames.push(next.data),
                    None => break,
                }
            }
            trace!(frames = frames.len(), "writer flushing batch");
            if self.write_timeout.is_zero() {
                transport.write_many(frames).await?;
            } else {
                match tokio::time::timeout(self.write_timeout, transport.write_many(frames)).await {
                    Ok(res) => res?,
                    Err(_) => return Err(TransportError::Timeout),
                }
            }
        }
        Ok(())
    }

    /// Close the queue; the writer loop drains remaining items and
    /// exits. Idempotent.
    pub fn close(&self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use relay_protocol::Encoding;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct SinkTransport {
        sink: mpsc::UnboundedSender<Vec<Bytes>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl Transport for SinkTransport {
        fn name(&self) -> &'static str {
            "sink"
        }

        fn encoding(&self) -> Encoding {
            Encoding::Json
        }

        async fn write(&self, data: Bytes) -> Result<(), TransportError> {
            self.write_many(vec![data]).await
        }

        async fn write_many(&self, frames: Vec<Bytes>) -> Result<(), TransportError> {
            if *self.fail.lock().unwrap() {
                return Err(TransportError::Closed);
            }
            self.sink.send(frames).map_err(|_| TransportError::Closed)
        }

        async fn close(&self, _disconnect: &Disconnect) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn item(data: &[u8]) -> Item {
        Item::new(Bytes::copy_from_slice(data), "")
    }

    #[tokio::test]
    async fn test_writer_merges_queued_frames() {
        let writer = Arc::new(Writer::new(0, 4, Duration::ZERO));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Arc::new(SinkTransport {
            sink: tx,
            fail: Mutex::new(false),
        });

        for i in 0..6u8 {
            writer.enqueue(item(&[i])).unwrap();
        }
        writer.close();
        writer.run(transport).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_writer_slow_consumer() {
        let writer = Writer::new(8, 4, Duration::ZERO);
        writer.enqueue(item(b"12345678")).unwrap();
        let err = writer.enqueue(item(b"overflow")).unwrap_err();
        assert_eq!(err, Disconnect::slow());
        // Queue closed; further enqueues fail.
        assert!(writer.enqueue(item(b"x")).is_err());
    }

    #[tokio::test]
    async fn test_writer_stops_on_write_error() {
        let writer = Arc::new(Writer::new(0, 4, Duration::ZERO));
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = Arc::new(SinkTransport {
            sink: tx,
            fail: Mutex::new(true),
        });
        writer.enqueue(item(b"x")).unwrap();
        writer.close();
        assert!(writer.run(transport).await.is_err());
    }
}
