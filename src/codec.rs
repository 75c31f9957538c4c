// ABOUTME: Wire codec for the change synchronization protocol
// ABOUTME: Tagged MessagePack messages with optional gzip transport compression

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sqlite_changelog::Change;

use crate::error::SyncError;

/// Encoded payloads above this size are gzip-compressed and flagged with a
/// `content-encoding: gzip` marker.
pub const COMPRESS_THRESHOLD: usize = 8 * 1024;

/// Response header signaling whether a pushed change set was accepted.
pub const ACCEPT_HEADER: &str = "x-roomsync-accept";
pub const ACCEPT_OK: &str = "ok";

/// Tagged protocol message. Field order inside [`ChangesMsg`] is the wire
/// contract; rmp-serde encodes structs positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Changes(ChangesMsg),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesMsg {
    pub sender: [u8; 16],
    pub since: (i64, i32),
    pub changes: Vec<Change>,
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Changes(_) => "changes",
            Message::Ping => "ping",
        }
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, SyncError> {
    rmp_serde::to_vec(message)
        .map_err(|err| SyncError::Storage(anyhow::anyhow!("failed to encode message: {err}")))
}

pub fn decode(bytes: &[u8]) -> Result<Message, SyncError> {
    rmp_serde::from_slice(bytes)
        .map_err(|err| SyncError::DecodeMismatch(format!("undecodable payload: {err}")))
}

/// Encode a change set for sending. Zero changes become a zero-length
/// payload, which every receiver accepts as "no changes".
pub fn encode_changes(
    sender: [u8; 16],
    since: (i64, i32),
    changes: Vec<Change>,
) -> Result<Vec<u8>, SyncError> {
    if changes.is_empty() {
        return Ok(Vec::new());
    }
    encode(&Message::Changes(ChangesMsg {
        sender,
        since,
        changes,
    }))
}

/// Gzip the payload when it exceeds [`COMPRESS_THRESHOLD`]. Returns the
/// bytes to send and whether the content-encoding marker must be set.
pub fn compress_if_large(bytes: Vec<u8>) -> (Vec<u8>, bool) {
    if bytes.len() <= COMPRESS_THRESHOLD {
        return (bytes, false);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(&bytes).is_err() {
        return (bytes, false);
    }
    match encoder.finish() {
        Ok(compressed) => (compressed, true),
        Err(_) => (bytes, false),
    }
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, SyncError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| SyncError::DecodeMismatch(format!("bad gzip payload: {err}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_change(db_version: i64) -> Change {
        Change {
            table: "test".into(),
            pk: serde_json::to_vec(&json!(1)).unwrap(),
            cid: 1,
            value: json!("hello"),
            col_version: 1,
            db_version,
            site_id: None,
            causal_length: 1,
            seq: 0,
        }
    }

    #[test]
    fn changes_message_round_trips() {
        let sender = [7u8; 16];
        let bytes = encode_changes(sender, (0, 0), vec![sample_change(1)]).unwrap();
        assert!(!bytes.is_empty());
        match decode(&bytes).unwrap() {
            Message::Changes(msg) => {
                assert_eq!(msg.sender, sender);
                assert_eq!(msg.since, (0, 0));
                assert_eq!(msg.changes.len(), 1);
                assert_eq!(msg.changes[0].value, json!("hello"));
            }
            other => panic!("unexpected tag {}", other.tag()),
        }
    }

    #[test]
    fn empty_change_set_is_a_zero_length_payload() {
        let bytes = encode_changes([0u8; 16], (5, 0), Vec::new()).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn garbage_is_a_decode_mismatch() {
        let err = decode(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, SyncError::DecodeMismatch(_)));
    }

    #[test]
    fn small_payloads_are_not_compressed() {
        let (bytes, compressed) = compress_if_large(vec![1, 2, 3]);
        assert!(!compressed);
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn large_payloads_compress_and_round_trip() {
        let changes: Vec<Change> = (0..2_000).map(|i| sample_change(i)).collect();
        let bytes = encode_changes([1u8; 16], (0, 0), changes).unwrap();
        assert!(bytes.len() > COMPRESS_THRESHOLD);
        let (wire, compressed) = compress_if_large(bytes.clone());
        assert!(compressed);
        assert!(wire.len() < bytes.len());
        assert_eq!(decompress(&wire).unwrap(), bytes);
    }

    #[test]
    fn ping_tag_survives_round_trip() {
        let bytes = encode(&Message::Ping).unwrap();
        assert_eq!(decode(&bytes).unwrap(), Message::Ping);
        assert_eq!(Message::Ping.tag(), "ping");
    }
}
