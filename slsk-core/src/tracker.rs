//! Concurrent registry of live transfers.
//!
//! Entries are keyed by direction, username, and filename. Each holds the
//! shared [`Transfer`] and the cancellation signal of the I/O loop driving it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use scc::hash_map::Entry;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transfer::{Transfer, TransferDirection, TransferEvent};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub direction: TransferDirection,
    pub username: String,
    pub filename: String,
}

impl TransferKey {
    pub fn new(
        direction: TransferDirection,
        username: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            username: username.into(),
            filename: filename.into(),
        }
    }

    fn of(transfer: &Transfer) -> Self {
        Self::new(transfer.direction, &*transfer.username, &*transfer.filename)
    }
}

/// A tracked transfer. Clones share the same `Transfer`, so updates made
/// through the tracker are visible to every holder.
#[derive(Debug, Clone)]
pub struct TrackedTransfer {
    transfer: Arc<RwLock<Transfer>>,
    cancellation: CancellationToken,
    sequence: u64,
}

impl TrackedTransfer {
    fn new(transfer: Transfer, cancellation: CancellationToken, sequence: u64) -> Self {
        Self {
            transfer: Arc::new(RwLock::new(transfer)),
            cancellation,
            sequence,
        }
    }

    /// Consistent copy of the transfer as of now.
    pub fn snapshot(&self) -> Transfer {
        self.transfer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Order in which the tracker first saw this transfer. Never reused.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Ask the owning I/O loop to stop. Does not touch the transfer's state.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    fn modify<R>(&self, f: impl FnOnce(&mut Transfer) -> R) -> R {
        f(&mut self.transfer.write().unwrap_or_else(PoisonError::into_inner))
    }

    fn apply(&self, update: &Transfer) {
        let mut transfer = self.transfer.write().unwrap_or_else(PoisonError::into_inner);
        transfer.token = update.token;
        transfer.size = update.size;
        transfer.bytes_transferred = update.bytes_transferred;
        transfer.state = update.state;
        transfer.start_time = update.start_time;
        transfer.end_time = update.end_time;
        transfer.message.clone_from(&update.message);
    }
}

#[derive(Default)]
pub struct TransferTracker {
    transfers: scc::HashMap<TransferKey, TrackedTransfer>,
    next_sequence: AtomicU64,
}

impl std::fmt::Debug for TransferTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferTracker")
            .field("len", &self.transfers.len())
            .finish()
    }
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the event's transfer, or update the existing entry in place.
    ///
    /// An existing entry keeps its cancellation signal; `cancellation` is
    /// only stored when a new entry is created.
    pub fn add_or_update(
        &self,
        event: &TransferEvent,
        cancellation: CancellationToken,
    ) -> TrackedTransfer {
        let transfer = event.transfer();
        match self.transfers.entry(TransferKey::of(transfer)) {
            Entry::Occupied(entry) => {
                let tracked = entry.get();
                tracked.apply(transfer);
                tracked.clone()
            }
            Entry::Vacant(entry) => {
                debug!(
                    direction = ?transfer.direction,
                    username = %transfer.username,
                    filename = %transfer.filename,
                    "tracking transfer"
                );
                let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                let entry = entry.insert_entry(TrackedTransfer::new(
                    transfer.clone(),
                    cancellation,
                    sequence,
                ));
                entry.get().clone()
            }
        }
    }

    /// Run `f` on the tracked transfer under its write lock, so the read,
    /// change, and write back cannot interleave with other updates to the
    /// same key. `f` must not change the direction, username, or filename.
    /// Returns `None` when nothing is tracked under the key.
    pub fn update<R>(
        &self,
        direction: TransferDirection,
        username: &str,
        filename: &str,
        f: impl FnOnce(&mut Transfer) -> R,
    ) -> Option<R> {
        self.transfers
            .read(&TransferKey::new(direction, username, filename), |_, tracked| {
                tracked.modify(f)
            })
    }

    /// Remove one entry, or every entry for `(direction, username)` when no
    /// filename is given. Returns how many entries were removed. Does not cancel.
    pub fn try_remove(
        &self,
        direction: TransferDirection,
        username: &str,
        filename: Option<&str>,
    ) -> usize {
        let removed = match filename {
            Some(filename) => {
                let key = TransferKey::new(direction, username, filename);
                usize::from(self.transfers.remove(&key).is_some())
            }
            None => {
                let mut removed = 0;
                self.transfers.retain(|key, _| {
                    let matches = key.direction == direction && key.username == username;
                    removed += usize::from(matches);
                    !matches
                });
                removed
            }
        };
        if removed > 0 {
            debug!(?direction, username, removed, "untracked transfers");
        }
        removed
    }

    pub fn get(
        &self,
        direction: TransferDirection,
        username: &str,
        filename: &str,
    ) -> Option<TrackedTransfer> {
        self.transfers
            .read(&TransferKey::new(direction, username, filename), |_, tracked| tracked.clone())
    }

    /// Handles for every transfer with `username` in `direction`, in the
    /// order they were first tracked.
    pub fn tracked(&self, direction: TransferDirection, username: &str) -> Vec<TrackedTransfer> {
        let mut tracked = Vec::new();
        self.transfers.scan(|key, entry| {
            if key.direction == direction && key.username == username {
                tracked.push(entry.clone());
            }
        });
        tracked.sort_by_key(TrackedTransfer::sequence);
        tracked
    }

    /// Snapshots of every transfer in one direction.
    pub fn transfers(&self, direction: TransferDirection) -> Vec<Transfer> {
        let mut transfers = Vec::new();
        self.transfers.scan(|key, tracked| {
            if key.direction == direction {
                transfers.push(tracked.snapshot());
            }
        });
        transfers
    }

    /// Signal cancellation for one transfer. Returns whether it was tracked.
    pub fn cancel(&self, direction: TransferDirection, username: &str, filename: &str) -> bool {
        self.get(direction, username, filename)
            .map(|tracked| tracked.cancel())
            .is_some()
    }

    /// Signal cancellation for every transfer with `username` in `direction`.
    pub fn cancel_all(&self, direction: TransferDirection, username: &str) -> usize {
        let mut cancelled = 0;
        self.transfers.scan(|key, tracked| {
            if key.direction == direction && key.username == username {
                tracked.cancel();
                cancelled += 1;
            }
        });
        cancelled
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferState;

    fn queued(direction: TransferDirection, username: &str, filename: &str) -> TransferEvent {
        let mut transfer = Transfer::new(direction, username, filename, 1);
        transfer.transition(TransferState::Queued, None)
    }

    #[test]
    fn bulk_removal_by_user() {
        let tracker = TransferTracker::new();
        for (user, file) in [("alice", "a"), ("alice", "b"), ("bob", "a")] {
            tracker.add_or_update(
                &queued(TransferDirection::Download, user, file),
                CancellationToken::new(),
            );
        }
        assert_eq!(tracker.try_remove(TransferDirection::Download, "alice", None), 2);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(TransferDirection::Download, "bob", "a").is_some());
    }

    #[test]
    fn single_removal_and_missing_entry() {
        let tracker = TransferTracker::new();
        tracker.add_or_update(&queued(TransferDirection::Upload, "alice", "a"), CancellationToken::new());
        tracker.add_or_update(&queued(TransferDirection::Upload, "alice", "b"), CancellationToken::new());
        assert_eq!(tracker.try_remove(TransferDirection::Upload, "alice", Some("a")), 1);
        assert_eq!(tracker.try_remove(TransferDirection::Upload, "alice", Some("a")), 0);
        assert_eq!(tracker.try_remove(TransferDirection::Download, "alice", None), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn update_in_place_is_visible_through_earlier_handles() {
        let tracker = TransferTracker::new();
        let mut transfer = Transfer::new(TransferDirection::Download, "alice", "a.mp3", 5);
        transfer.size = 1000;
        let first = tracker.add_or_update(&transfer.progress(100), CancellationToken::new());
        let replacement = CancellationToken::new();
        tracker.add_or_update(&transfer.progress(400), replacement.clone());

        assert_eq!(tracker.len(), 1);
        assert_eq!(first.snapshot().bytes_transferred, 400);
        replacement.cancel();
        assert!(!first.cancellation().is_cancelled());
    }

    #[test]
    fn state_updates_carry_timestamps() {
        let tracker = TransferTracker::new();
        let mut transfer = Transfer::new(TransferDirection::Download, "alice", "a.mp3", 5);
        let tracked = tracker.add_or_update(
            &transfer.transition(TransferState::Queued, None),
            CancellationToken::new(),
        );
        tracker.add_or_update(
            &transfer.transition(TransferState::InProgress, None),
            CancellationToken::new(),
        );
        tracker.add_or_update(
            &transfer.transition(TransferState::Rejected, Some("Banned".into())),
            CancellationToken::new(),
        );
        let seen = tracked.snapshot();
        assert_eq!(seen.state, TransferState::Rejected);
        assert!(seen.start_time.is_some());
        assert!(seen.end_time.is_some());
        assert_eq!(seen.message.as_deref(), Some("Banned"));
    }

    #[test]
    fn queries_and_cancellation() {
        let tracker = TransferTracker::new();
        let token = CancellationToken::new();
        tracker.add_or_update(&queued(TransferDirection::Upload, "alice", "a"), token.clone());
        tracker.add_or_update(&queued(TransferDirection::Upload, "alice", "b"), CancellationToken::new());
        tracker.add_or_update(&queued(TransferDirection::Download, "alice", "c"), CancellationToken::new());

        assert_eq!(tracker.transfers(TransferDirection::Upload).len(), 2);
        assert!(tracker.cancel(TransferDirection::Upload, "alice", "a"));
        assert!(token.is_cancelled());
        assert!(!tracker.cancel(TransferDirection::Upload, "bob", "a"));
        assert_eq!(tracker.cancel_all(TransferDirection::Upload, "alice"), 2);
        // cancelling leaves the entries in place
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn update_mutates_in_place_and_keeps_other_fields() {
        let tracker = TransferTracker::new();
        let tracked = tracker.add_or_update(
            &queued(TransferDirection::Download, "alice", "a"),
            CancellationToken::new(),
        );
        tracker.update(TransferDirection::Download, "alice", "a", |t| {
            t.bytes_transferred = 700;
        });
        let event = tracker
            .update(TransferDirection::Download, "alice", "a", |t| {
                t.size = 1000;
                t.transition(TransferState::InProgress, None)
            })
            .unwrap();
        assert!(matches!(event, TransferEvent::StateChanged { previous_state: TransferState::Queued, .. }));

        let seen = tracked.snapshot();
        assert_eq!(seen.state, TransferState::InProgress);
        assert_eq!(seen.bytes_transferred, 700);
        assert_eq!(seen.size, 1000);
        assert!(tracker
            .update(TransferDirection::Download, "alice", "missing", |_| ())
            .is_none());
    }

    #[test]
    fn concurrent_updates_to_one_key_are_not_lost() {
        let tracker = Arc::new(TransferTracker::new());
        tracker.add_or_update(
            &queued(TransferDirection::Upload, "alice", "a"),
            CancellationToken::new(),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        tracker.update(TransferDirection::Upload, "alice", "a", |t| {
                            t.bytes_transferred += 1;
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let seen = tracker.get(TransferDirection::Upload, "alice", "a").unwrap();
        assert_eq!(seen.snapshot().bytes_transferred, 1000);
    }

    #[test]
    fn sequence_follows_first_insertion() {
        let tracker = TransferTracker::new();
        for file in ["c", "a", "b"] {
            tracker.add_or_update(
                &queued(TransferDirection::Upload, "alice", file),
                CancellationToken::new(),
            );
        }
        // updating an entry keeps its place
        tracker.add_or_update(
            &queued(TransferDirection::Upload, "alice", "c"),
            CancellationToken::new(),
        );
        tracker.add_or_update(&queued(TransferDirection::Upload, "bob", "z"), CancellationToken::new());

        let order: Vec<_> = tracker
            .tracked(TransferDirection::Upload, "alice")
            .iter()
            .map(|t| t.snapshot().filename)
            .collect();
        assert_eq!(order, ["c", "a", "b"]);
    }

    #[test]
    fn concurrent_updates_to_distinct_keys() {
        let tracker = Arc::new(TransferTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let mut transfer =
                            Transfer::new(TransferDirection::Download, format!("user{t}"), format!("{i}"), i);
                        tracker.add_or_update(&transfer.progress(i64::from(i)), CancellationToken::new());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.len(), 400);
        assert_eq!(tracker.try_remove(TransferDirection::Download, "user3", None), 50);
        assert_eq!(tracker.len(), 350);
    }
}
