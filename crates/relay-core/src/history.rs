//! History contract and the in-memory stream store.
//!
//! Each channel with history keeps a bounded stream of publications with
//! monotonically increasing offsets inside an epoch. Discarding a stream
//! (TTL expiry or explicit removal) changes the epoch, which recovering
//! clients observe as a discontinuity.

use crate::errors::Error;
use async_trait::async_trait;
use dashmap::DashMap;
use relay_protocol::{Publication, StreamPosition};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Retention options of one history write.
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    /// Maximum number of retained publications.
    pub size: usize,
    /// Stream lifetime without new publications; zero means the stream
    /// never expires.
    pub ttl: Duration,
}

/// Read filter for [`HistoryManager::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Maximum publications to return; `None` means no limit,
    /// `Some(0)` returns only the current stream position.
    pub limit: Option<usize>,
    /// Return publications with offsets greater than this position.
    pub since: Option<StreamPosition>,
    /// Iterate from the stream end towards the beginning.
    pub reverse: bool,
}

/// Bounded per-channel publication streams.
#[async_trait]
pub trait HistoryManager: Send + Sync {
    /// Append a publication, assigning the next offset.
    async fn add_history(
        &self,
        channel: &str,
        publication: Publication,
        opts: &HistoryOptions,
    ) -> Result<StreamPosition, Error>;

    /// Read publications matching the filter plus the current position.
    async fn history(
        &self,
        channel: &str,
        filter: &HistoryFilter,
    ) -> Result<(Vec<Publication>, StreamPosition), Error>;

    /// Discard the channel stream; the next write starts a new epoch.
    async fn remove_history(&self, channel: &str) -> Result<(), Error>;

    /// Release resources.
    async fn close(&self) -> Result<(), Error>;
}

static EPOCH_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_epoch() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    format!("{:x}.{:x}", nanos, EPOCH_COUNTER.fetch_add(1, Ordering::Relaxed))
}

struct Stream {
    epoch: String,
    top_offset: u64,
    items: VecDeque<Publication>,
    // None means the stream never expires.
    expires_at: Option<Instant>,
}

impl Stream {
    fn new() -> Self {
        Self {
            epoch: generate_epoch(),
            top_offset: 0,
            items: VecDeque::new(),
            expires_at: None,
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }

    fn position(&self) -> StreamPosition {
        StreamPosition::new(self.top_offset, self.epoch.clone())
    }
}

/// In-process history manager.
#[derive(Default)]
pub struct MemoryHistoryManager {
    streams: DashMap<String, Stream>,
}

impl MemoryHistoryManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryManager for MemoryHistoryManager {
    async fn add_history(
        &self,
        channel: &str,
        mut publication: Publication,
        opts: &HistoryOptions,
    ) -> Result<StreamPosition, Error> {
        let mut entry = self
            .streams
            .entry(channel.to_string())
            .or_insert_with(Stream::new);
        let stream = entry.value_mut();
        if stream.expired() {
            trace!(channel = %channel, "history stream expired, starting new epoch");
            *stream = Stream::new();
        }

        stream.top_offset += 1;
        publication.offset = stream.top_offset;
        stream.items.push_back(publication);
        while opts.size > 0 && stream.items.len() > opts.size {
            stream.items.pop_front();
        }
        stream.expires_at = (!opts.ttl.is_zero()).then(|| Instant::now() + opts.ttl);

        Ok(stream.position())
    }

    async fn history(
        &self,
        channel: &str,
        filter: &HistoryFilter,
    ) -> Result<(Vec<Publication>, StreamPosition), Error> {
        let mut entry = self
            .streams
            .entry(channel.to_string())
            .or_insert_with(Stream::new);
        let stream = entry.value_mut();
        if stream.expired() {
            *stream = Stream::new();
        }
        let sp = stream.position();

        if filter.limit == Some(0) {
            return Ok((Vec::new(), sp));
        }

        let mut selected: Vec<Publication> = match &filter.since {
            Some(since) if since.epoch == stream.epoch => stream
                .items
                .iter()
                .filter(|p| p.offset > since.offset)
                .cloned()
                .collect(),
            Some(_) => {
                // Epoch mismatch: the requested range is gone. Return the
                // latest tail so the client can resync.
                stream.items.iter().cloned().collect()
            }
            None => stream.items.iter().cloned().collect(),
        };

        if filter.reverse {
            selected.reverse();
        }
        if let Some(limit) = filter.limit {
            selected.truncate(limit);
        }

        Ok((selected, sp))
    }

    async fn remove_history(&self, channel: &str) -> Result<(), Error> {
        self.streams.remove(channel);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.streams.clear();
        Ok(())
    }
}
