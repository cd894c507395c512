//! Persistence for runner progress accounting.
//!
//! Counters and dedup id sets are saved after every cycle and reloaded
//! on restart. This recovers progress accounting across a crash; item
//! content is recovered by the queue itself.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate counters and tracking sets for one runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerMetrics {
    /// Items handled successfully.
    pub total_processed: u64,
    /// Items marked failed (malformed or quarantined).
    pub total_failed: u64,
    /// Retries granted across the runner's lifetime.
    pub total_retries: u64,
    /// Source ids of successfully handled items (dedup set).
    #[serde(default)]
    pub processed_ids: HashSet<String>,
    /// Source ids of failed items (dedup set).
    #[serde(default)]
    pub failed_ids: HashSet<String>,
    /// Source ids enqueued but not yet resolved (dedup set).
    #[serde(default)]
    pub in_progress_ids: HashSet<String>,
    /// Last persistence time.
    pub updated_at: DateTime<Utc>,
}

impl Default for RunnerMetrics {
    fn default() -> Self {
        Self {
            total_processed: 0,
            total_failed: 0,
            total_retries: 0,
            processed_ids: HashSet::new(),
            failed_ids: HashSet::new(),
            in_progress_ids: HashSet::new(),
            updated_at: Utc::now(),
        }
    }
}

impl RunnerMetrics {
    /// Create zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a source id has already been enqueued, processed, or failed.
    #[must_use]
    pub fn has_seen(&self, source_id: &str) -> bool {
        self.processed_ids.contains(source_id)
            || self.failed_ids.contains(source_id)
            || self.in_progress_ids.contains(source_id)
    }

    /// Move a source id from in-progress to processed.
    pub fn mark_processed(&mut self, source_id: &str) {
        self.in_progress_ids.remove(source_id);
        self.processed_ids.insert(source_id.to_string());
        self.total_processed += 1;
    }

    /// Move a source id from in-progress to failed.
    pub fn mark_failed(&mut self, source_id: &str) {
        self.in_progress_ids.remove(source_id);
        self.failed_ids.insert(source_id.to_string());
        self.total_failed += 1;
    }

    /// Save the metrics to a JSON file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let mut snapshot = self.clone();
        snapshot.updated_at = Utc::now();

        let json =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize runner metrics")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write runner metrics to: {}", path.display()))?;
        Ok(())
    }

    /// Load metrics from a JSON file.
    ///
    /// Returns fresh metrics if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read runner metrics from: {}", path.display()))?;
        let metrics: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse runner metrics from: {}", path.display()))?;
        Ok(metrics)
    }

    /// Load metrics, or start fresh if the file is missing or corrupted.
    #[must_use]
    pub fn load_or_new(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Default persistence path for a worker's metrics.
    #[must_use]
    pub fn default_path(data_dir: &Path, worker_id: &str) -> PathBuf {
        data_dir.join("metrics").join(format!("{worker_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("metrics").join("w1.json");

        let mut metrics = RunnerMetrics::new();
        metrics.in_progress_ids.insert("s1".into());
        metrics.mark_processed("s1");
        metrics.total_retries = 2;
        metrics.save(&path).unwrap();

        let loaded = RunnerMetrics::load(&path).unwrap();
        assert_eq!(loaded.total_processed, 1);
        assert_eq!(loaded.total_retries, 2);
        assert!(loaded.processed_ids.contains("s1"));
        assert!(loaded.in_progress_ids.is_empty());
    }

    #[test]
    fn test_load_missing_returns_fresh() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let metrics = RunnerMetrics::load(&temp_dir.path().join("none.json")).unwrap();
        assert_eq!(metrics.total_processed, 0);
    }

    #[test]
    fn test_load_or_new_with_corrupted_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        std::fs::write(&path, "not valid json {{{").unwrap();

        let metrics = RunnerMetrics::load_or_new(&path);
        assert_eq!(metrics.total_processed, 0);
    }

    #[test]
    fn test_has_seen_across_sets() {
        let mut metrics = RunnerMetrics::new();
        assert!(!metrics.has_seen("a"));

        metrics.in_progress_ids.insert("a".into());
        assert!(metrics.has_seen("a"));

        metrics.mark_failed("a");
        assert!(metrics.has_seen("a"));
        assert_eq!(metrics.total_failed, 1);

        metrics.in_progress_ids.insert("b".into());
        metrics.mark_processed("b");
        assert!(metrics.has_seen("b"));
    }

    #[test]
    fn test_default_path() {
        let path = RunnerMetrics::default_path(Path::new("/data/.relay"), "w1");
        assert_eq!(path.to_string_lossy(), "/data/.relay/metrics/w1.json");
    }
}
