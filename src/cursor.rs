// ABOUTME: Sync cursor persistence - per (replica, room) high-water marks
// ABOUTME: Stored in a JSON state file outside the replica itself

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// High-water marks for one (local replica, room) pairing. Both fields are
/// non-decreasing over the lifetime of the pairing; losing the state file
/// only forces a full (idempotent) resend/refetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Highest locally-authored db_version acknowledged by the remote.
    pub last_sent: i64,
    /// Highest remote db_version applied locally.
    pub last_seen: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CursorFile {
    version: u32,
    cursors: HashMap<String, SyncCursor>,
}

/// File-backed cursor store, one JSON document per state directory.
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        if !state_dir.exists() {
            fs::create_dir_all(state_dir).with_context(|| {
                format!("failed to create state directory {}", state_dir.display())
            })?;
        }
        Ok(Self {
            path: state_dir.join("sync-cursors.json"),
        })
    }

    pub fn get(&self, replica_id: &[u8; 16], room: &str) -> Result<SyncCursor> {
        let file = self.load()?;
        Ok(file
            .cursors
            .get(&cursor_key(replica_id, room))
            .copied()
            .unwrap_or_default())
    }

    /// Advance a cursor. Regressions are clamped away so both fields stay
    /// non-decreasing even if a caller hands back a stale value.
    pub fn advance(
        &self,
        replica_id: &[u8; 16],
        room: &str,
        last_sent: Option<i64>,
        last_seen: Option<i64>,
    ) -> Result<SyncCursor> {
        let mut file = self.load()?;
        let entry = file.cursors.entry(cursor_key(replica_id, room)).or_default();
        if let Some(sent) = last_sent {
            entry.last_sent = entry.last_sent.max(sent);
        }
        if let Some(seen) = last_seen {
            entry.last_seen = entry.last_seen.max(seen);
        }
        let updated = *entry;
        self.save(&file)?;
        Ok(updated)
    }

    fn load(&self) -> Result<CursorFile> {
        if !self.path.exists() {
            return Ok(CursorFile {
                version: 1,
                cursors: HashMap::new(),
            });
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read cursor state from {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse cursor state from {}", self.path.display()))
    }

    fn save(&self, file: &CursorFile) -> Result<()> {
        let contents = serde_json::to_string_pretty(file).context("failed to serialize cursors")?;
        fs::write(&self.path, contents)
            .with_context(|| format!("failed to write cursor state to {}", self.path.display()))?;
        Ok(())
    }
}

fn cursor_key(replica_id: &[u8; 16], room: &str) -> String {
    format!("{}/{}", hex::encode(replica_id), room)
}
