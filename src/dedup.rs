//! Duplicate-notification suppression.
//!
//! The same event is routinely delivered by several relays, and each delivery
//! would otherwise produce its own push notification.  The table records
//! every `(event, subscriber)` pair a notification has been dispatched for;
//! the lookup-or-insert is a single atomic unit under the table's lock, which
//! is the sole correctness guarantee needed across concurrent, unordered
//! delivery from multiple relay tasks.
//!
//! Entries are pruned once older than the retention window.  The window must
//! exceed the worst-case cross-relay propagation delay, otherwise a late
//! duplicate would be mistaken for a fresh event.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

struct DedupEntry {
    relay_url: String,
    observed_at: Instant,
}

/// Outcome of a check-and-record call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// First sighting of this `(event, subscriber)` pair: dispatch.
    Fresh,
    /// Already dispatched; `first_relay` delivered it first.
    Duplicate { first_relay: String },
}

pub struct DedupTable {
    retention: Duration,
    inner: Mutex<HashMap<(String, String), DedupEntry>>,
}

impl DedupTable {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically record that a notification for `event_id` is being
    /// dispatched to `subscriber_id`, unless one already was.
    pub fn record(&self, event_id: &str, subscriber_id: &str, relay_url: &str) -> DedupDecision {
        let mut inner = self.inner.lock().unwrap();
        match inner.entry((event_id.to_string(), subscriber_id.to_string())) {
            Entry::Occupied(entry) => DedupDecision::Duplicate {
                first_relay: entry.get().relay_url.clone(),
            },
            Entry::Vacant(entry) => {
                entry.insert(DedupEntry {
                    relay_url: relay_url.to_string(),
                    observed_at: Instant::now(),
                });
                DedupDecision::Fresh
            }
        }
    }

    /// Drop entries older than the retention window.  Returns how many were
    /// removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|_, entry| entry.observed_at.elapsed() <= self.retention);
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweep task.  Runs until `shutdown_rx` fires (or its
    /// sender is dropped).
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = table.sweep();
                        if removed > 0 {
                            crate::nlog!("dedup: swept {} expired record(s), {} live", removed, table.len());
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_record_is_fresh_then_duplicate() {
        let table = DedupTable::new(Duration::from_secs(60));
        assert_eq!(table.record("ev1", "alice", "r1"), DedupDecision::Fresh);
        assert_eq!(
            table.record("ev1", "alice", "r2"),
            DedupDecision::Duplicate {
                first_relay: "r1".to_string()
            }
        );
        // Retried delivery from the first relay is also suppressed.
        assert_eq!(
            table.record("ev1", "alice", "r1"),
            DedupDecision::Duplicate {
                first_relay: "r1".to_string()
            }
        );
    }

    #[test]
    fn pairs_are_independent() {
        let table = DedupTable::new(Duration::from_secs(60));
        assert_eq!(table.record("ev1", "alice", "r1"), DedupDecision::Fresh);
        assert_eq!(table.record("ev1", "bob", "r1"), DedupDecision::Fresh);
        assert_eq!(table.record("ev2", "alice", "r1"), DedupDecision::Fresh);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let table = DedupTable::new(Duration::from_millis(30));
        table.record("ev1", "alice", "r1");
        std::thread::sleep(Duration::from_millis(60));
        table.record("ev2", "alice", "r1");

        assert_eq!(table.sweep(), 1);
        assert_eq!(table.len(), 1);
        // The surviving pair still deduplicates.
        assert!(matches!(
            table.record("ev2", "alice", "r2"),
            DedupDecision::Duplicate { .. }
        ));
    }

    #[test]
    fn sweep_within_retention_removes_nothing() {
        let table = DedupTable::new(Duration::from_secs(60));
        table.record("ev1", "alice", "r1");
        assert_eq!(table.sweep(), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_record_admits_exactly_one() {
        let table = Arc::new(DedupTable::new(Duration::from_secs(60)));
        let mut handles = Vec::new();
        for i in 0..8 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                table.record("ev1", "alice", &format!("r{i}")) == DedupDecision::Fresh
            }));
        }
        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fresh| *fresh)
            .count();
        assert_eq!(fresh, 1);
    }
}
