use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column id used for the row tombstone cell recorded on delete.
pub const TOMBSTONE_CID: i32 = -1;

/// One per-column versioned change cell.
///
/// Field order is the wire order: `(table, pk, cid, value, col_version,
/// db_version, site_id, causal_length, seq)`. `site_id` is `None` while the
/// change is only known to its authoring replica; it is filled in with the
/// originator's id once the change has been relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub table: String,
    pub pk: Vec<u8>,
    pub cid: i32,
    pub value: Value,
    pub col_version: i64,
    pub db_version: i64,
    pub site_id: Option<[u8; 16]>,
    pub causal_length: i64,
    pub seq: i32,
}

impl Change {
    pub fn is_tombstone(&self) -> bool {
        self.cid == TOMBSTONE_CID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_detection() {
        let change = Change {
            table: "test".into(),
            pk: vec![1],
            cid: TOMBSTONE_CID,
            value: Value::Null,
            col_version: 1,
            db_version: 3,
            site_id: None,
            causal_length: 2,
            seq: 0,
        };
        assert!(change.is_tombstone());
    }
}
