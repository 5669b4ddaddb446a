//! Persisted scan cursor so a restarted relay resumes where it stopped.

use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct CursorState {
    chain_id: u64,
    coordinator: Address,
    last_block: u64,
}

/// JSON file holding the last fully processed block.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
    chain_id: u64,
    coordinator: Address,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>, chain_id: u64, coordinator: Address) -> Self {
        Self {
            path: path.into(),
            chain_id,
            coordinator,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored cursor, or `None` if there is no usable state for this
    /// chain and coordinator.
    pub fn load(&self) -> Result<Option<u64>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read cursor {}", self.path.display()));
            }
        };
        let state: CursorState = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt cursor file {}", self.path.display()))?;

        if state.chain_id != self.chain_id || state.coordinator != self.coordinator {
            warn!(
                path = %self.path.display(),
                stored_chain = state.chain_id,
                stored_coordinator = %state.coordinator,
                "Cursor belongs to a different deployment, ignoring"
            );
            return Ok(None);
        }
        info!(path = %self.path.display(), last_block = state.last_block, "Loaded cursor");
        Ok(Some(state.last_block))
    }

    /// Write atomically via a sibling temp file and rename.
    pub fn save(&self, last_block: u64) -> Result<()> {
        let state = CursorState {
            chain_id: self.chain_id,
            coordinator: self.coordinator,
            last_block,
        };
        let body = serde_json::to_vec_pretty(&state).context("failed to encode cursor")?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir, chain_id: u64) -> CursorStore {
        CursorStore::new(
            dir.path().join("cursor.json"),
            chain_id,
            Address::repeat_byte(0xc0),
        )
    }

    #[test]
    fn missing_file_has_no_cursor() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store(&dir, 8453).load().unwrap(), None);
    }

    #[test]
    fn saved_cursor_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir, 8453);
        s.save(1234).unwrap();
        s.save(1300).unwrap();
        assert_eq!(s.load().unwrap(), Some(1300));
        assert!(!dir.path().join("cursor.json.tmp").exists());
    }

    #[test]
    fn other_chain_cursor_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir, 8453).save(99).unwrap();
        assert_eq!(store(&dir, 43114).load().unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir, 8453);
        std::fs::write(s.path(), "not json").unwrap();
        assert!(s.load().is_err());
    }
}
