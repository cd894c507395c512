//! Crash-safe, per-owner priority queue.
//!
//! Each owner namespace (worker identity) gets its own lock domain and
//! its own directory of durable records: one independently-parseable
//! JSON file per item under `active/<owner>/`, moved to
//! `archive/<owner>/` when the item is done. The in-memory ordering is
//! rebuilt from the active store on construction, which is how in-flight
//! items survive a process crash.
//!
//! Ordering within an owner is priority-then-FIFO: High items go ahead
//! of Normal items and FIFO within their tier. Across owners there is no
//! ordering guarantee and no lock contention.

pub mod item;

pub use item::{ItemKind, ItemState, Priority, QueueItem};

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};

#[derive(Default)]
struct OwnerQueue {
    /// Ids awaiting processing, head first.
    order: VecDeque<String>,
    /// Every live item, including dequeued in-flight ones.
    items: HashMap<String, QueueItem>,
}

impl OwnerQueue {
    /// Insert an id at the tail of its priority tier.
    fn insert_tail(&mut self, id: String, priority: Priority) {
        match priority {
            Priority::Normal => self.order.push_back(id),
            Priority::High => {
                let position = self.first_normal_position();
                self.order.insert(position, id);
            }
        }
    }

    /// Insert an id at the head of its priority tier.
    fn insert_head(&mut self, id: String, priority: Priority) {
        match priority {
            Priority::High => self.order.push_front(id),
            Priority::Normal => {
                let position = self.first_normal_position();
                self.order.insert(position, id);
            }
        }
    }

    fn first_normal_position(&self) -> usize {
        self.order
            .iter()
            .position(|queued| {
                self.items
                    .get(queued)
                    .is_none_or(|item| item.priority == Priority::Normal)
            })
            .unwrap_or(self.order.len())
    }
}

/// Disk-backed queue of work items, partitioned by owner.
///
/// # Example
///
/// ```no_run
/// use relay::queue::{PersistentQueue, Priority};
///
/// let queue = PersistentQueue::open(".relay/queue")?;
/// let id = queue.enqueue("w1", serde_json::json!({"task": "summarize"}), Priority::Normal)?;
/// let item = queue.dequeue("w1").unwrap();
/// assert_eq!(item.id, id);
/// # Ok::<(), relay::RelayError>(())
/// ```
pub struct PersistentQueue {
    active_dir: PathBuf,
    archive_dir: PathBuf,
    owners: RwLock<HashMap<String, Arc<Mutex<OwnerQueue>>>>,
}

impl PersistentQueue {
    /// Open (or create) a queue rooted at `root`, recovering every
    /// durable record into the in-memory ordering.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let queue = Self {
            active_dir: root.join("active"),
            archive_dir: root.join("archive"),
            owners: RwLock::new(HashMap::new()),
        };

        std::fs::create_dir_all(&queue.active_dir).with_context(|| {
            format!("Failed to create queue directory: {}", queue.active_dir.display())
        })?;
        std::fs::create_dir_all(&queue.archive_dir).with_context(|| {
            format!("Failed to create archive directory: {}", queue.archive_dir.display())
        })?;

        queue.recover()?;
        Ok(queue)
    }

    /// Open the queue under the configured data directory.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Self::open(config.data_dir.join("queue"))
    }

    /// Persist and enqueue a new message-kind item, returning its id.
    ///
    /// The durable record is written before the item becomes visible in
    /// the in-memory ordering.
    pub fn enqueue(
        &self,
        owner_id: &str,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<String> {
        self.enqueue_with_kind(owner_id, payload, priority, ItemKind::Message)
    }

    /// Persist and enqueue a new item with an explicit kind.
    pub fn enqueue_with_kind(
        &self,
        owner_id: &str,
        payload: serde_json::Value,
        priority: Priority,
        kind: ItemKind,
    ) -> Result<String> {
        let item = QueueItem::new(owner_id, payload, priority).with_kind(kind);
        self.write_item(&item)?;

        let queue = self.owner_queue(owner_id);
        let mut guard = lock(&queue);
        let id = item.id.clone();
        guard.insert_tail(id.clone(), priority);
        guard.items.insert(id.clone(), item);

        debug!(owner = owner_id, id = %id, %kind, %priority, "enqueued item");
        Ok(id)
    }

    /// Inspect the head of an owner's queue without removing it.
    #[must_use]
    pub fn peek(&self, owner_id: &str) -> Option<QueueItem> {
        let queue = self.owner_queue(owner_id);
        let guard = lock(&queue);
        guard
            .order
            .front()
            .and_then(|id| guard.items.get(id))
            .cloned()
    }

    /// Pop the head of an owner's queue.
    ///
    /// The item stays tracked (and durable) until it is archived; a
    /// dequeued item is in-flight, not gone.
    #[must_use]
    pub fn dequeue(&self, owner_id: &str) -> Option<QueueItem> {
        let queue = self.owner_queue(owner_id);
        let mut guard = lock(&queue);
        let id = guard.order.pop_front()?;
        guard.items.get(&id).cloned()
    }

    /// Put a dequeued item back at the head of its priority tier, for a
    /// retry on the next cycle. No-op if it is already queued.
    pub fn requeue(&self, owner_id: &str, item_id: &str) -> Result<()> {
        let queue = self.owner_queue(owner_id);
        let mut guard = lock(&queue);

        let Some(item) = guard.items.get(item_id) else {
            return Err(RelayError::item_not_found(owner_id, item_id));
        };
        let priority = item.priority;

        if !guard.order.iter().any(|queued| queued == item_id) {
            guard.insert_head(item_id.to_string(), priority);
        }
        Ok(())
    }

    /// Apply a lifecycle transition and rewrite the durable record.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidItemTransition`] for anything outside
    /// the validity table, or [`RelayError::ItemNotFound`] for unknown
    /// ids. The in-memory state changes even if the durable rewrite
    /// fails; persistence is best-effort-after-validation.
    pub fn update_state(&self, owner_id: &str, item_id: &str, new_state: ItemState) -> Result<()> {
        let queue = self.owner_queue(owner_id);
        let mut guard = lock(&queue);

        let item = guard
            .items
            .get_mut(item_id)
            .ok_or_else(|| RelayError::item_not_found(owner_id, item_id))?;

        if !item.state.can_transition_to(new_state) {
            return Err(RelayError::InvalidItemTransition {
                from: item.state,
                to: new_state,
            });
        }

        item.state = new_state;
        item.updated_at = Utc::now();
        let snapshot = item.clone();
        drop(guard);

        if let Err(e) = self.write_item(&snapshot) {
            warn!(owner = owner_id, id = item_id, "failed to persist item state: {e:#}");
        }
        Ok(())
    }

    /// Move an item's durable record to the archive store and drop it
    /// from the in-memory ordering.
    ///
    /// Idempotent: archiving an already-archived id succeeds.
    pub fn archive(&self, owner_id: &str, item_id: &str) -> Result<()> {
        let queue = self.owner_queue(owner_id);
        let mut guard = lock(&queue);
        guard.order.retain(|queued| queued != item_id);
        guard.items.remove(item_id);
        drop(guard);

        let active = self.active_path(owner_id, item_id);
        let archived = self.archive_path(owner_id, item_id);

        if active.exists() {
            if let Some(parent) = archived.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create archive directory: {}", parent.display())
                })?;
            }
            std::fs::rename(&active, &archived).with_context(|| {
                format!("Failed to archive item record: {}", active.display())
            })?;
            debug!(owner = owner_id, id = item_id, "archived item");
            Ok(())
        } else if archived.exists() {
            Ok(())
        } else {
            Err(RelayError::item_not_found(owner_id, item_id))
        }
    }

    /// Archive everything in the active store older than `max_age`
    /// (by file modification time). Returns the number of swept items.
    ///
    /// Maintenance sweep; not called from the hot path.
    pub fn cleanup_old(&self, max_age: Duration) -> Result<usize> {
        let mut swept = 0;
        for entry in WalkDir::new(&self.active_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        {
            let age = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.elapsed().ok());
            let Some(age) = age else { continue };
            if age < max_age {
                continue;
            }

            let Some((owner, id)) = owner_and_id(entry.path()) else {
                continue;
            };
            match self.archive(&owner, &id) {
                Ok(()) => swept += 1,
                Err(e) => warn!(owner = %owner, id = %id, "cleanup sweep failed: {e}"),
            }
        }

        if swept > 0 {
            debug!(swept, "cleanup_old archived stale items");
        }
        Ok(swept)
    }

    /// Number of items awaiting processing for an owner.
    #[must_use]
    pub fn len(&self, owner_id: &str) -> usize {
        let queue = self.owner_queue(owner_id);
        let guard = lock(&queue);
        guard.order.len()
    }

    /// Whether an owner has nothing awaiting processing.
    #[must_use]
    pub fn is_empty(&self, owner_id: &str) -> bool {
        self.len(owner_id) == 0
    }

    /// Fetch a tracked item (queued or in-flight) by id.
    #[must_use]
    pub fn get(&self, owner_id: &str, item_id: &str) -> Option<QueueItem> {
        let queue = self.owner_queue(owner_id);
        let guard = lock(&queue);
        guard.items.get(item_id).cloned()
    }

    /// Owner namespaces currently known to the queue.
    #[must_use]
    pub fn owners(&self) -> Vec<String> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    // ========================================================================
    // Recovery and persistence
    // ========================================================================

    /// Rebuild every owner's in-memory ordering from the active store.
    fn recover(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.active_dir).with_context(|| {
            format!("Failed to list queue directory: {}", self.active_dir.display())
        })?;

        for entry in entries.filter_map(std::result::Result::ok) {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let owner = entry.file_name().to_string_lossy().to_string();
            let restored = self.read_owner_records(&entry.path());
            if restored.is_empty() {
                continue;
            }

            let mut owner_queue = OwnerQueue::default();
            for item in restored {
                if item.state.is_in_flight() {
                    owner_queue.order.push_back(item.id.clone());
                }
                owner_queue.items.insert(item.id.clone(), item);
            }

            debug!(
                owner = %owner,
                queued = owner_queue.order.len(),
                tracked = owner_queue.items.len(),
                "recovered owner namespace"
            );
            self.owners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(owner, Arc::new(Mutex::new(owner_queue)));
        }
        Ok(())
    }

    /// Read and order one owner's records: priority tier first, then
    /// creation time. Corrupt records are logged and skipped, never
    /// fatal to recovery.
    fn read_owner_records(&self, dir: &Path) -> Vec<QueueItem> {
        let mut restored: Vec<QueueItem> = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| {
                let json = match std::fs::read_to_string(e.path()) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(path = %e.path().display(), "unreadable queue record: {err}");
                        return None;
                    }
                };
                match serde_json::from_str::<QueueItem>(&json) {
                    Ok(item) => Some(item),
                    Err(err) => {
                        warn!(path = %e.path().display(), "corrupt queue record: {err}");
                        None
                    }
                }
            })
            .collect();

        restored.sort_by_key(|item| {
            let tier = match item.priority {
                Priority::High => 0,
                Priority::Normal => 1,
            };
            (tier, item.created_at)
        });
        restored
    }

    /// Atomically write an item's durable record (temp file + rename).
    fn write_item(&self, item: &QueueItem) -> Result<()> {
        let path = self.active_path(&item.owner_id, &item.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create owner directory: {}", parent.display())
            })?;
        }

        let json = serde_json::to_string_pretty(item).context("Failed to serialize queue item")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write item record: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace item record: {}", path.display()))?;
        Ok(())
    }

    fn owner_queue(&self, owner_id: &str) -> Arc<Mutex<OwnerQueue>> {
        if let Some(queue) = self
            .owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner_id)
        {
            return Arc::clone(queue);
        }

        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(owners.entry(owner_id.to_string()).or_default())
    }

    fn active_path(&self, owner_id: &str, item_id: &str) -> PathBuf {
        self.active_dir.join(owner_id).join(format!("{item_id}.json"))
    }

    fn archive_path(&self, owner_id: &str, item_id: &str) -> PathBuf {
        self.archive_dir.join(owner_id).join(format!("{item_id}.json"))
    }
}

impl std::fmt::Debug for PersistentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentQueue")
            .field("active_dir", &self.active_dir)
            .field("owners", &self.owners())
            .finish()
    }
}

fn lock(queue: &Mutex<OwnerQueue>) -> MutexGuard<'_, OwnerQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Extract `(owner, item_id)` from an `active/<owner>/<id>.json` path.
fn owner_and_id(path: &Path) -> Option<(String, String)> {
    let id = path.file_stem()?.to_string_lossy().to_string();
    let owner = path.parent()?.file_name()?.to_string_lossy().to_string();
    Some((owner, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_queue(temp_dir: &tempfile::TempDir) -> PersistentQueue {
        PersistentQueue::open(temp_dir.path().join("queue")).unwrap()
    }

    #[test]
    fn test_enqueue_dequeue_fifo() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        let a = queue.enqueue("w1", json!("a"), Priority::Normal).unwrap();
        let b = queue.enqueue("w1", json!("b"), Priority::Normal).unwrap();

        assert_eq!(queue.dequeue("w1").unwrap().id, a);
        assert_eq!(queue.dequeue("w1").unwrap().id, b);
        assert!(queue.dequeue("w1").is_none());
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        queue.enqueue("w1", json!("a"), Priority::Normal).unwrap();
        queue.enqueue("w1", json!("b"), Priority::High).unwrap();
        queue.enqueue("w1", json!("c"), Priority::Normal).unwrap();

        let order: Vec<serde_json::Value> = std::iter::from_fn(|| queue.dequeue("w1"))
            .map(|item| item.payload)
            .collect();
        assert_eq!(order, vec![json!("b"), json!("a"), json!("c")]);
    }

    #[test]
    fn test_high_priority_fifo_within_tier() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        queue.enqueue("w1", json!("n1"), Priority::Normal).unwrap();
        queue.enqueue("w1", json!("h1"), Priority::High).unwrap();
        queue.enqueue("w1", json!("h2"), Priority::High).unwrap();

        let order: Vec<serde_json::Value> = std::iter::from_fn(|| queue.dequeue("w1"))
            .map(|item| item.payload)
            .collect();
        assert_eq!(order, vec![json!("h1"), json!("h2"), json!("n1")]);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        let id = queue.enqueue("w1", json!(1), Priority::Normal).unwrap();
        assert_eq!(queue.peek("w1").unwrap().id, id);
        assert_eq!(queue.peek("w1").unwrap().id, id);
        assert_eq!(queue.len("w1"), 1);
    }

    #[test]
    fn test_owners_are_independent() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        queue.enqueue("w1", json!(1), Priority::Normal).unwrap();
        queue.enqueue("w2", json!(2), Priority::Normal).unwrap();

        assert_eq!(queue.len("w1"), 1);
        assert_eq!(queue.len("w2"), 1);
        let _ = queue.dequeue("w1");
        assert_eq!(queue.len("w2"), 1);
    }

    #[test]
    fn test_update_state_valid_transitions() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        let id = queue.enqueue("w1", json!(1), Priority::Normal).unwrap();
        queue.update_state("w1", &id, ItemState::Sent).unwrap();
        queue.update_state("w1", &id, ItemState::Read).unwrap();
        assert_eq!(queue.get("w1", &id).unwrap().state, ItemState::Read);
    }

    #[test]
    fn test_update_state_rejects_invalid_transition() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        let id = queue.enqueue("w1", json!(1), Priority::Normal).unwrap();
        let err = queue.update_state("w1", &id, ItemState::Read).unwrap_err();
        assert!(matches!(err, RelayError::InvalidItemTransition { .. }));
        // State untouched by the rejected transition.
        assert_eq!(queue.get("w1", &id).unwrap().state, ItemState::Pending);
    }

    #[test]
    fn test_update_state_unknown_item() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);
        let err = queue.update_state("w1", "missing", ItemState::Sent).unwrap_err();
        assert!(matches!(err, RelayError::ItemNotFound { .. }));
    }

    #[test]
    fn test_archive_is_idempotent() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        let id = queue.enqueue("w1", json!(1), Priority::Normal).unwrap();
        queue.archive("w1", &id).unwrap();
        queue.archive("w1", &id).unwrap();

        assert!(queue.get("w1", &id).is_none());
        assert!(queue.is_empty("w1"));
    }

    #[test]
    fn test_archive_unknown_item_errors() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);
        assert!(queue.archive("w1", "missing").is_err());
    }

    #[test]
    fn test_crash_recovery_roundtrip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path().join("queue");

        let ids = {
            let queue = PersistentQueue::open(&root).unwrap();
            let a = queue.enqueue("w1", json!("a"), Priority::Normal).unwrap();
            let b = queue.enqueue("w1", json!("b"), Priority::High).unwrap();
            let c = queue.enqueue("w1", json!("c"), Priority::Normal).unwrap();
            queue.update_state("w1", &a, ItemState::Sent).unwrap();
            vec![a, b, c]
        };

        // Simulated restart: reconstruct over the same durable store.
        let recovered = PersistentQueue::open(&root).unwrap();
        assert_eq!(recovered.len("w1"), 3);
        assert_eq!(recovered.get("w1", &ids[0]).unwrap().state, ItemState::Sent);
        assert_eq!(recovered.get("w1", &ids[1]).unwrap().state, ItemState::Pending);

        // Priority order preserved across the restart.
        assert_eq!(recovered.dequeue("w1").unwrap().id, ids[1]);
        assert_eq!(recovered.dequeue("w1").unwrap().id, ids[0]);
        assert_eq!(recovered.dequeue("w1").unwrap().id, ids[2]);
    }

    #[test]
    fn test_recovery_skips_terminal_items() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path().join("queue");

        let done = {
            let queue = PersistentQueue::open(&root).unwrap();
            let done = queue.enqueue("w1", json!("done"), Priority::Normal).unwrap();
            queue.enqueue("w1", json!("todo"), Priority::Normal).unwrap();
            queue.update_state("w1", &done, ItemState::Sent).unwrap();
            queue.update_state("w1", &done, ItemState::Read).unwrap();
            done
        };

        let recovered = PersistentQueue::open(&root).unwrap();
        // The Read item is tracked but not queued for processing again.
        assert_eq!(recovered.len("w1"), 1);
        assert!(recovered.get("w1", &done).is_some());
    }

    #[test]
    fn test_recovery_tolerates_corrupt_records() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path().join("queue");

        {
            let queue = PersistentQueue::open(&root).unwrap();
            queue.enqueue("w1", json!("good"), Priority::Normal).unwrap();
        }
        std::fs::write(root.join("active").join("w1").join("junk.json"), "not json {{{").unwrap();

        let recovered = PersistentQueue::open(&root).unwrap();
        assert_eq!(recovered.len("w1"), 1);
    }

    #[test]
    fn test_requeue_puts_item_back_at_tier_head() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        let first = queue.enqueue("w1", json!(1), Priority::Normal).unwrap();
        let second = queue.enqueue("w1", json!(2), Priority::Normal).unwrap();

        let in_flight = queue.dequeue("w1").unwrap();
        assert_eq!(in_flight.id, first);
        queue.requeue("w1", &first).unwrap();

        assert_eq!(queue.dequeue("w1").unwrap().id, first);
        assert_eq!(queue.dequeue("w1").unwrap().id, second);
    }

    #[test]
    fn test_requeue_is_noop_when_already_queued() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        let id = queue.enqueue("w1", json!(1), Priority::Normal).unwrap();
        queue.requeue("w1", &id).unwrap();
        assert_eq!(queue.len("w1"), 1);
    }

    #[test]
    fn test_cleanup_old_archives_stale_items() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        queue.enqueue("w1", json!(1), Priority::Normal).unwrap();
        queue.enqueue("w2", json!(2), Priority::Normal).unwrap();

        // Zero max age: everything in the active store is stale.
        let swept = queue.cleanup_old(Duration::ZERO).unwrap();
        assert_eq!(swept, 2);
        assert!(queue.is_empty("w1"));
        assert!(queue.is_empty("w2"));
    }

    #[test]
    fn test_cleanup_old_keeps_fresh_items() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let queue = open_queue(&temp_dir);

        queue.enqueue("w1", json!(1), Priority::Normal).unwrap();
        let swept = queue.cleanup_old(Duration::from_secs(3600)).unwrap();
        assert_eq!(swept, 0);
        assert_eq!(queue.len("w1"), 1);
    }
}
