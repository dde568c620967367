//! In-process store adapter.
//!
//! Mirrors the hash semantics of a Redis-style server closely enough for the
//! engine: `HINCRBY`/`HDEL`/`HGET`/`EXPIRE`, keys vanishing once their last
//! field is removed, and expiry of `0` deleting the key. Expiry runs on the
//! `tokio::time` clock so tests can pause and advance it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{Batch, OpOutcome, StoreError, StoreOp, WindowStore};

/// Minimum time between two sweeps of expired keys.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl HashEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, HashEntry>,
    swept_at: Option<Instant>,
}

impl Keyspace {
    fn purge_if_expired(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    /// Drop every expired key, at most once per [`SWEEP_INTERVAL`].
    fn sweep(&mut self, now: Instant) {
        let due = self
            .swept_at
            .map_or(true, |at| now.saturating_duration_since(at) >= SWEEP_INTERVAL);
        if !due {
            return;
        }

        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.swept_at = Some(now);

        let removed = before - self.entries.len();
        if removed > 0 {
            trace!(removed, remaining = self.entries.len(), "Swept expired keys");
        }
    }
}

/// A [`WindowStore`] kept in process memory.
///
/// Every batch runs under a single lock, which makes it atomic and isolated
/// with respect to every other batch. Batches are staged on a copy of the
/// touched keys and only committed when every op succeeded. Expired keys are
/// dropped when next touched and by a periodic sweep run from
/// `execute_batch`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: Mutex<Keyspace>,
    pending_failures: Mutex<usize>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` batches fail with [`StoreError::Unavailable`]
    /// without touching any data.
    pub fn fail_next_batches(&self, count: usize) {
        *self.pending_failures.lock() += count;
    }

    /// Snapshot of the fields stored under `key`, if the key is live.
    pub fn fields(&self, key: &str) -> Option<HashMap<String, String>> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        keys.purge_if_expired(key, now);
        keys.entries.get(key).map(|entry| entry.fields.clone())
    }

    /// Remaining time-to-live of `key`. `None` when the key is absent or has
    /// no expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        keys.purge_if_expired(key, now);
        keys.entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Write a raw field value, bypassing increment semantics.
    pub fn insert_raw(&self, key: &str, field: &str, value: &str) {
        let mut keys = self.keys.lock();
        keys.entries
            .entry(key.to_string())
            .or_default()
            .fields
            .insert(field.to_string(), value.to_string());
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        let keys = self.keys.lock();
        keys.entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    fn take_failure(&self) -> bool {
        let mut pending = self.pending_failures.lock();
        if *pending > 0 {
            *pending -= 1;
            true
        } else {
            false
        }
    }
}

fn op_key(op: &StoreOp) -> &str {
    match op {
        StoreOp::IncrementField { key, .. }
        | StoreOp::DeleteField { key, .. }
        | StoreOp::GetField { key, .. }
        | StoreOp::DiscardField { key, .. }
        | StoreOp::Expire { key, .. } => key,
    }
}

/// Remove `field`, or only when it holds `expected` if one is given.
fn remove_field(
    staged: &mut HashMap<String, Option<HashEntry>>,
    key: &str,
    field: &str,
    expected: Option<&str>,
) {
    let emptied = match staged.get_mut(key) {
        Some(Some(entry)) => {
            let matches = match expected {
                Some(expected) => entry.fields.get(field).is_some_and(|v| v == expected),
                None => true,
            };
            if matches {
                entry.fields.remove(field);
            }
            entry.fields.is_empty()
        }
        _ => false,
    };
    if emptied {
        staged.insert(key.to_string(), None);
    }
}

fn apply(
    staged: &mut HashMap<String, Option<HashEntry>>,
    op: &StoreOp,
    now: Instant,
) -> Result<OpOutcome, StoreError> {
    match op {
        StoreOp::IncrementField { key, field, delta } => {
            let entry = staged
                .entry(key.clone())
                .or_default()
                .get_or_insert_with(HashEntry::default);
            let current = match entry.fields.get(field) {
                Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::CorruptField {
                    key: key.clone(),
                    field: field.clone(),
                })?,
                None => 0,
            };
            let updated = current.checked_add(*delta).ok_or_else(|| {
                StoreError::Aborted(format!("increment of {key}/{field} overflows"))
            })?;
            entry.fields.insert(field.clone(), updated.to_string());
            Ok(OpOutcome::Integer(updated))
        }
        StoreOp::DeleteField { key, field } => {
            remove_field(staged, key, field, None);
            Ok(OpOutcome::Done)
        }
        StoreOp::DiscardField {
            key,
            field,
            expected,
        } => {
            remove_field(staged, key, field, Some(expected));
            Ok(OpOutcome::Done)
        }
        StoreOp::GetField { key, field } => {
            let value = staged
                .get(key)
                .and_then(|slot| slot.as_ref())
                .and_then(|entry| entry.fields.get(field).cloned());
            Ok(OpOutcome::Field(value))
        }
        StoreOp::Expire { key, ttl_secs } => {
            if *ttl_secs == 0 {
                staged.insert(key.clone(), None);
            } else if let Some(Some(entry)) = staged.get_mut(key) {
                entry.expires_at = Some(now + Duration::from_secs(*ttl_secs));
            }
            Ok(OpOutcome::Done)
        }
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn execute_batch(&self, batch: Batch) -> Result<Vec<OpOutcome>, StoreError> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let now = Instant::now();
        let mut keys = self.keys.lock();
        keys.sweep(now);

        // Stage a copy of every touched key; `None` marks a deleted key.
        let mut staged: HashMap<String, Option<HashEntry>> = HashMap::new();
        for op in batch.ops() {
            let key = op_key(op);
            if staged.contains_key(key) {
                continue;
            }
            keys.purge_if_expired(key, now);
            staged.insert(key.to_string(), keys.entries.get(key).cloned());
        }

        let mut outcomes = Vec::with_capacity(batch.len());
        for op in batch.ops() {
            outcomes.push(apply(&mut staged, op, now)?);
        }

        for (key, slot) in staged {
            match slot {
                Some(entry) if !entry.fields.is_empty() => {
                    keys.entries.insert(key, entry);
                }
                _ => {
                    keys.entries.remove(&key);
                }
            }
        }

        trace!(ops = batch.len(), "Applied batch to memory store");
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl MemoryStore {
        /// Entries held in memory, expired or not.
        fn stored_len(&self) -> usize {
            self.keys.lock().entries.len()
        }
    }

    #[tokio::test]
    async fn test_increment_creates_key_and_field() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.increment("k", "3", 1).increment("k", "3", 2);

        let outcomes = store.execute_batch(batch).await.unwrap();
        assert_eq!(outcomes, vec![OpOutcome::Integer(1), OpOutcome::Integer(3)]);
        assert_eq!(store.fields("k").unwrap()["3"], "3");
    }

    #[tokio::test]
    async fn test_get_absent_and_delete_idempotent() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.get("k", "1").delete("k", "1").delete("missing", "1");

        let outcomes = store.execute_batch(batch).await.unwrap();
        assert_eq!(
            outcomes,
            vec![OpOutcome::Field(None), OpOutcome::Done, OpOutcome::Done]
        );
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_deleting_last_field_removes_key() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.increment("k", "1", 1);
        store.execute_batch(batch).await.unwrap();

        let mut batch = Batch::new();
        batch.delete("k", "1");
        store.execute_batch(batch).await.unwrap();

        assert!(store.fields("k").is_none());
    }

    #[tokio::test]
    async fn test_failed_batch_is_not_applied() {
        let store = MemoryStore::new();
        store.insert_raw("k", "bad", "not-a-number");

        let mut batch = Batch::new();
        batch.increment("k", "good", 1).increment("k", "bad", 1);

        let result = store.execute_batch(batch).await;
        assert!(matches!(
            result,
            Err(StoreError::CorruptField { ref key, ref field }) if key == "k" && field == "bad"
        ));

        let fields = store.fields("k").unwrap();
        assert!(!fields.contains_key("good"));
        assert_eq!(fields["bad"], "not-a-number");
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        store.fail_next_batches(1);

        let mut batch = Batch::new();
        batch.increment("k", "1", 1);
        let result = store.execute_batch(batch.clone()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.key_count(), 0);

        // Only the requested number of batches fail
        assert!(store.execute_batch(batch).await.is_ok());
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.increment("k", "1", 1).expire("k", 10);
        store.execute_batch(batch).await.unwrap();

        assert_eq!(store.ttl("k"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.fields("k").is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.fields("k").is_none());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_expire_zero_deletes_key() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.increment("k", "1", 1).expire("k", 0);
        store.execute_batch(batch).await.unwrap();

        assert!(store.fields("k").is_none());
    }

    #[tokio::test]
    async fn test_delete_before_increment_replaces_corrupt_field() {
        let store = MemoryStore::new();
        store.insert_raw("k", "1", "junk");

        let mut batch = Batch::new();
        batch.delete("k", "1").increment("k", "1", 3);

        let outcomes = store.execute_batch(batch).await.unwrap();
        assert_eq!(outcomes[1], OpOutcome::Integer(3));
        assert_eq!(store.fields("k").unwrap()["1"], "3");
    }

    #[tokio::test]
    async fn test_discard_only_removes_expected_value() {
        let store = MemoryStore::new();
        store.insert_raw("k", "1", "junk");
        store.insert_raw("k", "2", "5");

        let mut batch = Batch::new();
        batch.discard("k", "1", "junk").discard("k", "2", "junk");
        store.execute_batch(batch).await.unwrap();

        let fields = store.fields("k").unwrap();
        assert!(!fields.contains_key("1"));
        assert_eq!(fields["2"], "5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_are_swept() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            let mut batch = Batch::new();
            batch.increment(&format!("k{i}"), "1", 1).expire(&format!("k{i}"), 5);
            store.execute_batch(batch).await.unwrap();
        }
        assert_eq!(store.stored_len(), 1000);

        tokio::time::advance(Duration::from_secs(60)).await;

        // A batch on an unrelated key drops every expired entry
        let mut batch = Batch::new();
        batch.increment("other", "1", 1);
        store.execute_batch(batch).await.unwrap();

        assert_eq!(store.stored_len(), 1);
        assert_eq!(store.key_count(), 1);
    }
}
