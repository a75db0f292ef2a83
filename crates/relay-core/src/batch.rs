//! Per-channel coalescing writer.
//!
//! Accumulates frames per channel and flushes them as one batch, governed
//! by a per-channel [`ChannelBatchConfig`]: flush when the buffer reaches
//! `max_size`, when `max_delay` elapses since the batch was started, or
//! keep only the newest frame when `flush_latest` is set.
//!
//! Scheduling uses a single task per writer with a min-heap of
//! `(deadline, channel)` entries, never one timer per channel.

use crate::errors::Disconnect;
use crate::queue::Item;
use crate::types::ChannelId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// Batching policy for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelBatchConfig {
    /// Flush when this many frames are buffered; zero disables the size
    /// trigger.
    pub max_size: usize,
    /// Flush this long after the first frame of a batch; zero disables
    /// the delay trigger.
    pub max_delay: Duration,
    /// Keep only the newest buffered frame; intermediate frames are
    /// dropped. Opt-in quality of service for state-snapshot channels.
    pub flush_latest: bool,
}

impl ChannelBatchConfig {
    /// Whether this config asks for batching at all.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.max_size > 0 || !self.max_delay.is_zero()
    }
}

/// Batch flush sink. Receives the drained items of exactly one channel,
/// in insertion order.
pub type FlushFn = Box<dyn Fn(Vec<Item>) -> Result<(), Disconnect> + Send + Sync>;

#[derive(Default)]
struct Buffer {
    items: Vec<Item>,
    // Adds since the last flush. With flush_latest the buffer holds one
    // item while this keeps counting, so the size trigger still fires.
    adds: usize,
    // Deadline the scheduler will honor for this channel; heap entries
    // with a different instant are stale and skipped.
    armed_at: Option<Instant>,
}

impl Buffer {
    fn take(&mut self) -> Vec<Item> {
        self.adds = 0;
        self.armed_at = None;
        std::mem::take(&mut self.items)
    }
}

struct Deadline {
    at: Instant,
    channel: ChannelId,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for Deadline {}
impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at)
    }
}

struct State {
    buffers: HashMap<ChannelId, Buffer>,
    // First-insertion order of channels, for deterministic drain.
    order: Vec<ChannelId>,
    heap: BinaryHeap<Reverse<Deadline>>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    flush: FlushFn,
}

/// Coalesces frames per channel and flushes batches to a sink.
pub struct PerChannelWriter {
    shared: Arc<Shared>,
}

impl PerChannelWriter {
    /// Create a writer and start its scheduler task.
    #[must_use]
    pub fn new(flush: FlushFn) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buffers: HashMap::new(),
                order: Vec::new(),
                heap: BinaryHeap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            flush,
        });
        tokio::spawn(Self::run(shared.clone()));
        Self { shared }
    }

    /// Add a frame for a channel under the given batching policy.
    ///
    /// # Errors
    ///
    /// Propagates the sink's disconnect when an immediate flush fails;
    /// the writer stops batching after the first sink failure.
    pub fn add(&self, item: Item, cfg: &ChannelBatchConfig) -> Result<(), Disconnect> {
        let channel = item.channel.clone();
        let mut to_flush = None;
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                // Batching over; hand the frame straight to the sink.
                return (self.shared.flush)(vec![item]);
            }
            if !state.buffers.contains_key(&channel) {
                state.order.push(channel.clone());
            }
            let buffer = state.buffers.entry(channel.clone()).or_default();
            if cfg.flush_latest {
                buffer.items.clear();
            }
            buffer.items.push(item);
            buffer.adds += 1;

            if cfg.max_size > 0 && buffer.adds >= cfg.max_size {
                to_flush = Some(buffer.take());
            } else if buffer.armed_at.is_none() {
                if !cfg.max_delay.is_zero() {
                    let at = Instant::now() + cfg.max_delay;
                    buffer.armed_at = Some(at);
                    state.heap.push(Reverse(Deadline {
                        at,
                        channel: channel.clone(),
                    }));
                } else if cfg.max_size <= 1 {
                    // No triggers configured at all: per-item flush.
                    to_flush = Some(buffer.take());
                }
                // With max_delay = 0 and max_size > 1 the batch waits for
                // the size trigger alone.
            }
        }
        self.shared.notify.notify_one();
        match to_flush {
            Some(items) => self.flush_items(items),
            None => Ok(()),
        }
    }

    /// Flush a single channel's buffer immediately, out of schedule.
    ///
    /// # Errors
    ///
    /// Propagates the sink's disconnect on failure.
    pub fn flush_channel(&self, channel: &str) -> Result<(), Disconnect> {
        let items = {
            let mut state = self.shared.state.lock().unwrap();
            match state.buffers.get_mut(channel) {
                Some(buffer) => buffer.take(),
                None => return Ok(()),
            }
        };
        if items.is_empty() {
            return Ok(());
        }
        self.flush_items(items)
    }

    /// Stop the scheduler. With `drain`, remaining buffers are flushed in
    /// channel insertion order. Idempotent.
    pub fn close(&self, drain: bool) {
        let pending = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.heap.clear();
            let order = std::mem::take(&mut state.order);
            let mut buffers = std::mem::take(&mut state.buffers);
            if drain {
                order
                    .into_iter()
                    .filter_map(|ch| buffers.remove(&ch))
                    .map(|b| b.items)
                    .filter(|items| !items.is_empty())
                    .collect()
            } else {
                Vec::new()
            }
        };
        self.shared.notify.notify_waiters();
        for items in pending {
            if let Err(d) = self.flush_items(items) {
                debug!(disconnect = %d, "batch drain flush failed");
                break;
            }
        }
    }

    fn flush_items(&self, items: Vec<Item>) -> Result<(), Disconnect> {
        if let Err(d) = (self.shared.flush)(items) {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
            state.buffers.clear();
            state.heap.clear();
            drop(state);
            self.shared.notify.notify_waiters();
            return Err(d);
        }
        Ok(())
    }

    async fn run(shared: Arc<Shared>) {
        loop {
            let mut due: Vec<Vec<Item>> = Vec::new();
            let next = {
                let mut state = shared.state.lock().unwrap();
                if state.closed {
                    return;
                }
                let now = Instant::now();
                while let Some(Reverse(head)) = state.heap.peek() {
                    if head.at > now {
                        break;
                    }
                    let Reverse(deadline) = state.heap.pop().unwrap();
                    if let Some(buffer) = state.buffers.get_mut(&deadline.channel) {
                        // Stale entries (re-armed or size-flushed channels)
                        // carry a different instant.
                        if buffer.armed_at == Some(deadline.at) && !buffer.items.is_empty() {
                            due.push(buffer.take());
                        }
                    }
                }
                state.heap.peek().map(|Reverse(d)| d.at)
            };

            for items in due {
                if let Err(d) = (shared.flush)(items) {
                    debug!(disconnect = %d, "batch flush failed, stopping writer");
                    let mut state = shared.state.lock().unwrap();
                    state.closed = true;
                    state.buffers.clear();
                    state.heap.clear();
                    return;
                }
            }

            match next {
                Some(at) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                        () = shared.notify.notified() => {}
                    }
                }
                None => shared.notify.notified().await,
            }
        }
    }
}

impl Drop for PerChannelWriter {
    fn drop(&mut self) {
        self.close(false);
    }
}
