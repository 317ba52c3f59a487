//! Persisted output transfer-ID counters.
//!
//! Short-lived CLI invocations would otherwise restart every session at
//! transfer-ID zero, which remote nodes may discard as duplicates. The counters
//! are stored per local node-ID and reused only if the file is recent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use yakut_common::types::NodeId;

use crate::error::{Result, TransportError};
use crate::transfer::DataSpecifier;

/// Transfer-ID counters of one local node.
#[derive(Debug, Clone, Default)]
pub struct TransferIdMap {
    path: Option<PathBuf>,
    counters: BTreeMap<String, u64>,
}

impl TransferIdMap {
    /// An in-memory map that is never persisted (anonymous nodes).
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::default()
    }

    /// Loads the map of `node_id` from `dir`, ignoring files older than `max_age`.
    /// Unreadable or stale files yield an empty map.
    #[must_use]
    pub fn load(dir: &Path, node_id: NodeId, max_age: Duration) -> Self {
        let path = dir.join(node_id.to_string());
        let counters = Self::read_fresh(&path, max_age).unwrap_or_default();
        tracing::debug!(path = %path.display(), sessions = counters.len(), "output transfer-ID map loaded");
        Self {
            path: Some(path),
            counters,
        }
    }

    fn read_fresh(path: &Path, max_age: Duration) -> Option<BTreeMap<String, u64>> {
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age > max_age {
            tracing::debug!(path = %path.display(), age = ?age, "output transfer-ID map is stale");
            return None;
        }
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text)
            .map_err(|e| tracing::warn!(path = %path.display(), error = %e, "ignoring corrupted transfer-ID map"))
            .ok()
    }

    /// Returns the next transfer-ID for the session and advances its counter.
    pub fn next(&mut self, specifier: &DataSpecifier, modulo: u64) -> u64 {
        let counter = self.counters.entry(specifier.session_key()).or_insert(0);
        let tid = *counter;
        *counter = if modulo == 0 { tid.wrapping_add(1) } else { (tid + 1) % modulo };
        tid
    }

    /// Writes the map back to disk if it is persistent.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| TransportError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let text = serde_json::to_string(&self.counters)?;
        std::fs::write(path, text).map_err(|source| TransportError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), sessions = self.counters.len(), "output transfer-ID map saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use yakut_common::types::SubjectId;

    use super::*;

    fn subject() -> DataSpecifier {
        DataSpecifier::Message(SubjectId::new(33).expect("subject"))
    }

    #[test]
    fn counters_increment_per_session() {
        let mut map = TransferIdMap::ephemeral();
        assert_eq!(map.next(&subject(), 32), 0);
        assert_eq!(map.next(&subject(), 32), 1);
    }

    #[test]
    fn counters_wrap_at_modulo() {
        let mut map = TransferIdMap::ephemeral();
        for _ in 0..32 {
            let _ = map.next(&subject(), 32);
        }
        assert_eq!(map.next(&subject(), 32), 0);
    }

    #[test]
    fn saved_map_is_reused_when_fresh() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut map = TransferIdMap::load(tmp.path(), NodeId::new(5), Duration::from_secs(60));
        let _ = map.next(&subject(), u64::MAX);
        let _ = map.next(&subject(), u64::MAX);
        map.save().expect("save");
        let mut again = TransferIdMap::load(tmp.path(), NodeId::new(5), Duration::from_secs(60));
        assert_eq!(again.next(&subject(), u64::MAX), 2);
        let file = std::fs::File::options().write(true).open(tmp.path().join("5")).expect("open");
        file.set_modified(SystemTime::now() - Duration::from_secs(120)).expect("touch");
        let mut stale = TransferIdMap::load(tmp.path(), NodeId::new(5), Duration::from_secs(60));
        assert_eq!(stale.next(&subject(), u64::MAX), 0);
    }

    #[test]
    fn ephemeral_map_is_not_written() {
        assert!(TransferIdMap::ephemeral().save().is_ok());
    }
}
