// ABOUTME: Server-side replica provisioning with a single-slot handle cache
// ABOUTME: Validates room names and schema identity before opening a replica

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use sqlite_changelog::ChangeLogStore;

use crate::error::SyncError;
use crate::schema::SchemaDef;

pub type SharedStore = Arc<StdMutex<ChangeLogStore>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReplicaKey {
    room: String,
    schema_version: u32,
}

struct OpenReplica {
    key: ReplicaKey,
    store: SharedStore,
}

/// Single-slot cache of the most recently used replica handle.
///
/// The server holds at most one open replica at a time: a hit on the exact
/// `(room, schema_version)` key returns the open handle unchanged, any
/// other key closes the current handle before the new one is opened.
/// Cross-room switching is a strict evict-then-open, never concurrent.
pub struct ReplicaCache {
    schema: SchemaDef,
    data_dir: Option<PathBuf>,
    slot: Mutex<Option<OpenReplica>>,
}

impl ReplicaCache {
    /// `data_dir = None` keeps replicas in memory (they live as long as the
    /// cache slot holds them), which is how tests and ephemeral servers run.
    pub fn new(schema: SchemaDef, data_dir: Option<PathBuf>) -> Self {
        Self {
            schema,
            data_dir,
            slot: Mutex::new(None),
        }
    }

    pub fn schema(&self) -> &SchemaDef {
        &self.schema
    }

    /// Open (or reuse) the replica for a room, checking schema identity.
    ///
    /// `create_if_missing` is true only for requests that push changes; a
    /// pull against a room that has no replica yet is refused so replicas
    /// are never created for rooms nobody has written to.
    pub async fn provision(
        &self,
        room: &str,
        schema_version: u32,
        create_if_missing: bool,
    ) -> Result<SharedStore, SyncError> {
        validate_room_name(room)?;
        let fingerprint = self.schema.fingerprint();
        if fingerprint != schema_version {
            return Err(SyncError::SchemaVersionMismatch {
                server: fingerprint,
                requested: schema_version,
            });
        }

        let key = ReplicaKey {
            room: room.to_string(),
            schema_version,
        };
        let mut slot = self.slot.lock().await;
        if let Some(open) = slot.as_ref() {
            if open.key == key {
                return Ok(Arc::clone(&open.store));
            }
        }
        // Evict before opening: the previous handle is fully closed first.
        if let Some(evicted) = slot.take() {
            tracing::debug!(room = %evicted.key.room, "evicting cached replica");
            drop(evicted);
        }

        let store = self.open_replica(room, create_if_missing)?;
        let store: SharedStore = Arc::new(StdMutex::new(store));
        *slot = Some(OpenReplica {
            key,
            store: Arc::clone(&store),
        });
        Ok(store)
    }

    fn open_replica(&self, room: &str, create_if_missing: bool) -> Result<ChangeLogStore, SyncError> {
        let mut store = match &self.data_dir {
            Some(dir) => {
                let path = dir.join(format!("{room}.db"));
                if !path.exists() && !create_if_missing {
                    return Err(SyncError::StorageUnavailable(format!(
                        "no replica for room '{room}' yet; push changes first to create/migrate"
                    )));
                }
                ChangeLogStore::open(&path).map_err(|err| {
                    SyncError::StorageUnavailable(format!(
                        "cannot open replica for room '{room}' ({err}); push changes first to create/migrate"
                    ))
                })?
            }
            None => ChangeLogStore::open_in_memory().map_err(SyncError::Storage)?,
        };

        let fingerprint = self.schema.fingerprint();
        match store.schema_meta().map_err(SyncError::Storage)? {
            Some((stored_name, _)) if stored_name != self.schema.name => {
                return Err(SyncError::SchemaConflict {
                    stored: stored_name,
                    requested: self.schema.name.clone(),
                });
            }
            Some((_, stored_version)) if stored_version == fingerprint => {}
            _ => {
                // Fresh replica, or versions differ: migrate in place by
                // reapplying the canonical (additive) schema text.
                store
                    .apply_schema(&self.schema.name, fingerprint, &self.schema.text)
                    .map_err(SyncError::Storage)?;
            }
        }
        Ok(store)
    }
}

/// Room names become file names; anything that could traverse paths is
/// rejected before storage is touched.
pub fn validate_room_name(room: &str) -> Result<(), SyncError> {
    if room.is_empty() || room.len() > 128 {
        return Err(SyncError::InvalidArgument(format!(
            "room name must be 1-128 characters, got {}",
            room.len()
        )));
    }
    if room.contains("..") {
        return Err(SyncError::InvalidArgument(
            "room name must not contain '..'".to_string(),
        ));
    }
    if let Some(bad) = room
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
    {
        return Err(SyncError::InvalidArgument(format!(
            "room name contains invalid character '{bad}'"
        )));
    }
    Ok(())
}
