use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of entries kept when no capacity is configured
pub const DEFAULT_CAPACITY: usize = 7;

/// Recently loaded references, most recent first.
/// Entries are unique ignoring ASCII case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct History {
    #[serde(default)]
    entries: Vec<String>,
    #[serde(skip, default = "default_capacity")]
    capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        History {
            entries: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Load history from file, trimming it to `capacity`
    pub fn load(path: &Path, capacity: usize) -> Result<Self> {
        let mut history = Self::with_capacity(capacity);
        if !path.exists() {
            return Ok(history);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read history from {:?}", path))?;
        let stored: History = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse history from {:?}", path))?;

        // Re-insert oldest first so dedup and capacity rules apply to old files too
        for entry in stored.entries.iter().rev() {
            history.insert(entry);
        }
        Ok(history)
    }

    /// Save history atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize history")?;
        let temp_path = path.with_extension("yaml.tmp");
        fs::write(&temp_path, content)
            .with_context(|| format!("Failed to write history to {:?}", temp_path))?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to move history into place at {:?}", path))?;

        Ok(())
    }

    /// Put `entry` at the front, moving it there if already present
    pub fn insert(&mut self, entry: &str) {
        let entry = entry.trim();
        if entry.is_empty() {
            return;
        }
        self.entries.retain(|existing| !existing.eq_ignore_ascii_case(entry));
        self.entries.insert(0, entry.to_string());
        self.entries.truncate(self.capacity);
    }

    /// Remove an entry, ignoring case. Returns whether it was present.
    pub fn remove(&mut self, entry: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|existing| !existing.eq_ignore_ascii_case(entry.trim()));
        before != self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Serializes history writes to one file. Snapshots are numbered when taken,
/// and a snapshot older than the last one written is dropped, so writes that
/// finish out of order never roll the file back.
#[derive(Debug)]
pub(crate) struct HistoryStore {
    path: PathBuf,
    taken: AtomicU64,
    written: Mutex<u64>,
}

impl HistoryStore {
    pub fn new(path: PathBuf) -> Arc<Self> {
        Arc::new(HistoryStore {
            path,
            taken: AtomicU64::new(0),
            written: Mutex::new(0),
        })
    }

    /// Copy `history` for writing later; take it while holding the history lock
    pub fn snapshot(self: &Arc<Self>, history: &History) -> HistorySnapshot {
        HistorySnapshot {
            store: self.clone(),
            version: self.taken.fetch_add(1, Ordering::Relaxed) + 1,
            history: history.clone(),
        }
    }
}

pub(crate) struct HistorySnapshot {
    store: Arc<HistoryStore>,
    version: u64,
    history: History,
}

impl HistorySnapshot {
    /// Blocking write; failures only warn
    pub fn write(self) {
        let mut written = self.store.written.lock();
        if self.version <= *written {
            tracing::debug!("Skipping history snapshot {} (have {})", self.version, *written);
            return;
        }
        if let Err(e) = self.history.save(&self.store.path) {
            tracing::warn!("Failed to save history: {:#}", e);
        }
        *written = self.version;
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_dedup_and_capacity() {
        let mut history = History::with_capacity(7);
        for entry in ["a", "b", "a", "c", "d", "e", "f", "g"] {
            history.insert(entry);
        }

        assert_eq!(history.entries(), ["g", "f", "e", "d", "c", "a", "b"]);
    }

    #[test]
    fn test_oldest_evicted() {
        let mut history = History::with_capacity(3);
        for entry in ["a", "b", "c", "d"] {
            history.insert(entry);
        }

        assert_eq!(history.entries(), ["d", "c", "b"]);
    }

    #[test]
    fn test_case_insensitive_dedup() {
        let mut history = History::default();
        history.insert("example.com/app:v1");
        history.insert("EXAMPLE.com/app:v1");

        assert_eq!(history.entries(), ["EXAMPLE.com/app:v1"]);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut history = History::default();
        history.insert("a");
        history.insert("b");

        assert!(history.remove("A"));
        assert!(!history.remove("missing"));
        assert_eq!(history.entries(), ["b"]);

        history.clear();
        assert!(history.entries().is_empty());
    }

    #[test]
    fn test_blank_entries_ignored() {
        let mut history = History::default();
        history.insert("   ");
        assert!(history.entries().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.yaml");

        let mut history = History::default();
        history.insert("a");
        history.insert("b");
        history.save(&path).unwrap();

        let loaded = History::load(&path, 7).unwrap();
        assert_eq!(loaded.entries(), ["b", "a"]);

        let trimmed = History::load(&path, 1).unwrap();
        assert_eq!(trimmed.entries(), ["b"]);
    }

    #[test]
    fn test_stale_snapshot_never_overwrites_newer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.yaml");
        let store = HistoryStore::new(path.clone());

        let mut history = History::default();
        history.insert("a");
        let older = store.snapshot(&history);
        history.insert("b");
        let newer = store.snapshot(&history);

        newer.write();
        older.write();

        let loaded = History::load(&path, 7).unwrap();
        assert_eq!(loaded.entries(), ["b", "a"]);
    }
}
