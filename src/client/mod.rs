// ABOUTME: Client role - drives the push/pull round trip against a room
// ABOUTME: Cursors advance only after a fully successful send or apply

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;

use sqlite_changelog::ChangeLogStore;

use crate::codec::{self, Message, ACCEPT_HEADER, ACCEPT_OK};
use crate::cursor::CursorStore;
use crate::error::SyncError;
use crate::schema::SchemaDef;

pub type SharedStore = Arc<StdMutex<ChangeLogStore>>;

/// Named scoped exclusive locks for replica open/close: only one
/// open-or-close operation for a given replica name runs at a time,
/// overlapping requests queue behind the name's mutex.
#[derive(Default)]
pub struct ReplicaLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReplicaLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("replica lock registry poisoned");
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Open a replica under the name's exclusive lock and apply the schema.
    pub async fn open_replica(
        &self,
        name: &str,
        path: Option<&Path>,
        schema: &SchemaDef,
    ) -> Result<SharedStore, SyncError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let mut store = match path {
            Some(path) => ChangeLogStore::open(path).map_err(SyncError::Storage)?,
            None => ChangeLogStore::open_in_memory().map_err(SyncError::Storage)?,
        };
        if let Some((stored_name, _)) = store.schema_meta().map_err(SyncError::Storage)? {
            if stored_name != schema.name {
                return Err(SyncError::SchemaConflict {
                    stored: stored_name,
                    requested: schema.name.clone(),
                });
            }
        }
        store
            .apply_schema(&schema.name, schema.fingerprint(), &schema.text)
            .map_err(SyncError::Storage)?;
        Ok(Arc::new(StdMutex::new(store)))
    }
}

/// Outcome of one round trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundTripSummary {
    pub sent: usize,
    pub accepted: bool,
    pub received: usize,
    pub last_sent: i64,
    pub last_seen: i64,
}

pub struct SyncClient {
    http: reqwest::Client,
    server: String,
    room: String,
    schema_version: u32,
    store: SharedStore,
    cursors: CursorStore,
}

impl SyncClient {
    pub fn new(
        server: impl Into<String>,
        room: impl Into<String>,
        schema_version: u32,
        store: SharedStore,
        cursors: CursorStore,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create HTTP client")
            .map_err(SyncError::Storage)?;
        Ok(Self {
            http,
            server: server.into().trim_end_matches('/').to_string(),
            room: room.into(),
            schema_version,
            store,
            cursors,
        })
    }

    /// One push-then-pull exchange with the server.
    ///
    /// Cursors only move after a fully successful send or apply, so a crash
    /// or failure mid-round-trip just means the same delta is resent or
    /// refetched next time; the merge contract makes that a no-op. There is
    /// no retry in here - the caller schedules the next attempt.
    pub async fn round_trip(&self) -> Result<RoundTripSummary, SyncError> {
        let site_id = {
            let store = self.store.lock().expect("replica store poisoned");
            store.site_id()
        };
        let cursor = self.cursors.get(&site_id, &self.room)?;
        let outgoing = {
            let store = self.store.lock().expect("replica store poisoned");
            store
                .local_changes_since(cursor.last_sent)
                .map_err(SyncError::Storage)?
        };
        let sent_high_water = outgoing.last().map(|change| change.db_version);
        let sent = outgoing.len();

        let payload = codec::encode_changes(site_id, (cursor.last_sent, 0), outgoing)?;
        tracing::debug!(
            room = %self.room,
            sent,
            since = cursor.last_seen,
            bytes = payload.len(),
            "starting round trip"
        );

        let response = self
            .http
            .post(format!("{}/api/changes/{}", self.server, self.room))
            .query(&[
                ("schemaVersion", self.schema_version.to_string()),
                ("requestor", hex::encode(site_id)),
                ("since", cursor.last_seen.to_string()),
            ])
            .body(payload)
            .send()
            .await
            .map_err(|err| SyncError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.text().await {
                Ok(body) => parse_error_body(&body),
                Err(_) => status.to_string(),
            };
            return Err(SyncError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let mut summary = RoundTripSummary {
            sent,
            ..RoundTripSummary::default()
        };

        // Push acknowledgment: accepted advances last_sent to the highest
        // db_version we sent; a rejection leaves it put so the next round
        // trip resends the same (idempotent) delta.
        let accept = response
            .headers()
            .get(ACCEPT_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if sent > 0 {
            if accept == ACCEPT_OK {
                summary.accepted = true;
            } else {
                tracing::warn!(room = %self.room, accept = %accept, "push was not accepted; will resend");
            }
        }

        let compressed = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|encoding| encoding.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);
        let body = response
            .bytes()
            .await
            .map_err(|err| SyncError::Network(err.to_string()))?;
        let body = if compressed {
            codec::decompress(&body)?
        } else {
            body.to_vec()
        };

        let mut seen_high_water = None;
        if !body.is_empty() {
            match codec::decode(&body) {
                Ok(Message::Changes(msg)) if !msg.changes.is_empty() => {
                    let applied = {
                        let mut store = self.store.lock().expect("replica store poisoned");
                        store
                            .merge_changes(&msg.changes, msg.sender)
                            .map_err(SyncError::Storage)?
                    };
                    summary.received = msg.changes.len();
                    seen_high_water = msg.changes.last().map(|change| change.db_version);
                    tracing::info!(
                        room = %self.room,
                        received = summary.received,
                        applied,
                        "applied remote changes"
                    );
                }
                Ok(Message::Changes(_)) => {}
                Ok(other) => {
                    // No useful data; cursors stay put.
                    tracing::warn!(room = %self.room, tag = other.tag(), "ignoring unexpected response tag");
                }
                Err(err) => {
                    tracing::warn!(room = %self.room, %err, "ignoring undecodable response body");
                }
            }
        }

        let updated = self.cursors.advance(
            &site_id,
            &self.room,
            if summary.accepted { sent_high_water } else { None },
            seen_high_water,
        )?;
        summary.last_sent = updated.last_sent;
        summary.last_seen = updated.last_seen;
        Ok(summary)
    }

    /// Repeat round trips on a fixed cadence, logging failures and carrying
    /// on. Fatal schema errors stop the loop.
    pub async fn watch(&self, interval: Duration) -> Result<(), SyncError> {
        loop {
            match self.round_trip().await {
                Ok(summary) => {
                    if summary.sent > 0 || summary.received > 0 {
                        tracing::info!(
                            room = %self.room,
                            sent = summary.sent,
                            received = summary.received,
                            "round trip completed"
                        );
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(room = %self.room, %err, "round trip failed; will retry");
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn parse_error_body(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|message| message.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}
