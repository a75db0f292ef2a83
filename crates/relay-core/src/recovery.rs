//! Recovery helpers.
//!
//! When a client resubscribes with a known stream position, the history
//! catch-up runs concurrently with live delivery. Live publications
//! arriving meanwhile are buffered by the subscription; this module
//! merges both streams into one offset-ordered, duplicate-free sequence
//! and decides whether recovery covered the requested range.

use relay_protocol::{Publication, StreamPosition};

/// Merge the history catch-up stream with live publications buffered
/// during catch-up.
///
/// Input order within each vector is preserved for equal offsets: on a
/// duplicate offset the copy from `history` (lower-indexed) wins. The
/// result is strictly offset-ordered.
#[must_use]
pub fn merge_recovered(
    history: Vec<Publication>,
    buffered: Vec<Publication>,
) -> Vec<Publication> {
    let mut merged = history;
    merged.extend(buffered);
    // Stable sort keeps the earlier (history) copy first among equal
    // offsets; dedup then drops the later one.
    merged.sort_by_key(|p| p.offset);
    merged.dedup_by_key(|p| p.offset);
    merged
}

/// Decide whether a catch-up reply fully covered the range requested by
/// `since`.
///
/// Recovery fails when the epoch changed or when the stream evicted
/// publications past the requested offset.
#[must_use]
pub fn is_recovered(
    since: &StreamPosition,
    current: &StreamPosition,
    publications: &[Publication],
) -> bool {
    if since.epoch != current.epoch {
        return false;
    }
    match publications.first() {
        Some(first) => {
            first.offset == since.offset + 1
                && publications
                    .last()
                    .is_some_and(|last| last.offset == current.offset)
        }
        None => since.offset == current.offset,
    }
}
