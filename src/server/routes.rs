// ABOUTME: HTTP surface for the sync protocol - one changes endpoint per room
// ABOUTME: Applies pushed change sets transactionally and relays the outbound delta

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::codec::{self, Message, ACCEPT_HEADER, ACCEPT_OK};
use crate::error::SyncError;
use crate::server::provision::ReplicaCache;

pub struct ServerState {
    pub replicas: ReplicaCache,
}

#[derive(Debug, Deserialize)]
struct ChangesParams {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    requestor: String,
    since: i64,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/changes/:room", post(post_changes))
        .with_state(state)
}

/// Serve the sync API until the process is stopped.
pub async fn serve(addr: SocketAddr, state: Arc<ServerState>) -> Result<()> {
    tracing::info!("listening on http://{addr}");
    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .await
        .context("sync server exited with error")?;
    Ok(())
}

async fn post_changes(
    State(state): State<Arc<ServerState>>,
    Path(room): Path<String>,
    Query(params): Query<ChangesParams>,
    body: Bytes,
) -> Response {
    match handle_changes(&state, &room, &params, &body).await {
        Ok(response) => response,
        Err(err) => error_response(err),
    }
}

async fn handle_changes(
    state: &ServerState,
    room: &str,
    params: &ChangesParams,
    body: &[u8],
) -> Result<Response, SyncError> {
    let requestor = decode_requestor(&params.requestor)?;
    let store = state
        .replicas
        .provision(room, params.schema_version, !body.is_empty())
        .await?;

    // Apply the pushed delta, all-or-nothing. An unexpected tag (or an
    // undecodable payload) rejects the push but still answers with the
    // outbound delta; nothing partially lands.
    let mut accept = ACCEPT_OK.to_string();
    if !body.is_empty() {
        match codec::decode(body) {
            Ok(Message::Changes(msg)) => {
                let applied = {
                    let mut store = store.lock().expect("replica store poisoned");
                    store
                        .merge_changes(&msg.changes, msg.sender)
                        .map_err(SyncError::Storage)?
                };
                tracing::info!(
                    room,
                    requestor = %params.requestor,
                    received = msg.changes.len(),
                    applied,
                    "applied pushed changes"
                );
            }
            Ok(other) => {
                tracing::warn!(room, tag = other.tag(), "rejected push with unexpected tag");
                accept = format!("error={}", other.tag());
            }
            Err(err) => {
                tracing::warn!(room, %err, "rejected undecodable push");
                accept = "error=decode".to_string();
            }
        }
    }

    // Outbound delta: everything since the requestor's cursor except its
    // own changes, tagged with this replica's identity as sender.
    let (sender, outbound) = {
        let store = store.lock().expect("replica store poisoned");
        let outbound = store
            .changes_since_excluding(params.since, &requestor)
            .map_err(SyncError::Storage)?;
        (store.site_id(), outbound)
    };
    tracing::debug!(room, since = params.since, returned = outbound.len(), "computed outbound delta");

    let payload = codec::encode_changes(sender, (params.since, 0), outbound)?;
    let (payload, compressed) = codec::compress_if_large(payload);

    let mut response = payload.into_response();
    response.headers_mut().insert(
        ACCEPT_HEADER,
        HeaderValue::from_str(&accept).unwrap_or_else(|_| HeaderValue::from_static("error")),
    );
    if compressed {
        response
            .headers_mut()
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    Ok(response)
}

fn decode_requestor(requestor: &str) -> Result<[u8; 16], SyncError> {
    let bytes = hex::decode(requestor)
        .map_err(|_| SyncError::InvalidArgument("requestor must be hex".to_string()))?;
    bytes
        .try_into()
        .map_err(|_| SyncError::InvalidArgument("requestor must be 16 bytes".to_string()))
}

fn error_response(err: SyncError) -> Response {
    let status = match &err {
        SyncError::InvalidArgument(_)
        | SyncError::SchemaConflict { .. }
        | SyncError::SchemaVersionMismatch { .. }
        | SyncError::StorageUnavailable(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(%err, status = %status, "changes request failed");
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requestor_must_be_16_hex_bytes() {
        assert!(decode_requestor(&hex::encode([3u8; 16])).is_ok());
        assert!(decode_requestor("zz").is_err());
        assert!(decode_requestor("abcd").is_err());
    }

    #[test]
    fn taxonomy_maps_to_client_errors() {
        let response = error_response(SyncError::InvalidArgument("bad room".into()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = error_response(SyncError::StorageUnavailable("push changes first".into()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = error_response(SyncError::Storage(anyhow::anyhow!("disk on fire")));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
