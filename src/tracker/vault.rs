//! Durable archive of unrecoverable errors.
//!
//! Critical-severity [`ErrorRecord`]s are written here as one JSON file
//! per record, named by worker, kind, and timestamp. The vault is
//! append-only from the tracker's point of view: nothing in this crate
//! ever deletes a vaulted record. Operators read it for post-mortems.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

use super::ErrorRecord;

/// Append-only store of Critical error records.
#[derive(Debug, Clone)]
pub struct FailureVault {
    dir: PathBuf,
}

impl FailureVault {
    /// Create a vault rooted at `dir`. The directory is created lazily
    /// on first archive.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory of the vault.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a record to the vault, returning the file path.
    ///
    /// File name: `<worker>__<kind>__<timestamp_ms>.json`. Collisions on
    /// the same millisecond are disambiguated with a numeric suffix so a
    /// burst of failures never overwrites an earlier record.
    pub fn archive(&self, record: &ErrorRecord) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create vault directory: {}", self.dir.display()))?;

        let stem = format!(
            "{}__{}__{}",
            sanitize(&record.worker_id),
            record.kind,
            record.timestamp.timestamp_millis()
        );

        let mut path = self.dir.join(format!("{stem}.json"));
        let mut suffix = 1u32;
        while path.exists() {
            path = self.dir.join(format!("{stem}-{suffix}.json"));
            suffix += 1;
        }

        let json = serde_json::to_string_pretty(record)
            .context("Failed to serialize error record")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write vault record: {}", path.display()))?;

        debug!(path = %path.display(), "archived error record to vault");
        Ok(path)
    }

    /// List every vaulted record file, sorted by path.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries: Vec<PathBuf> = WalkDir::new(&self.dir)
            .min_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .map(|e| e.into_path())
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// Load a vaulted record back for inspection.
    pub fn load(&self, path: &Path) -> Result<ErrorRecord> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vault record: {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse vault record: {}", path.display()))
    }
}

/// Replace path-hostile characters in worker ids.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
