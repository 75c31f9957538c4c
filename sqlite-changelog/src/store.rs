use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use crate::change::{Change, TOMBSTONE_CID};
use crate::introspect;
use crate::notify::NotificationHub;

const INTERNAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _changelog_site (
    site_id   BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS _changelog_meta (
    key       TEXT PRIMARY KEY,
    value     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS _changelog_cells (
    tbl           TEXT NOT NULL,
    pk            BLOB NOT NULL,
    cid           INTEGER NOT NULL,
    value         TEXT,
    col_version   INTEGER NOT NULL,
    db_version    INTEGER NOT NULL,
    site_id       BLOB,
    causal_length INTEGER NOT NULL,
    seq           INTEGER NOT NULL,
    PRIMARY KEY (tbl, pk, cid)
);

CREATE INDEX IF NOT EXISTS _changelog_cells_db_version
    ON _changelog_cells(db_version);
"#;

/// A change-log enabled SQLite store.
///
/// Every local write records per-column change cells next to the
/// materialized row: `(table, pk, cid, value, col_version, db_version,
/// site_id, causal_length, seq)`. `db_version` is a store-local monotonic
/// counter stamped per write transaction; `site_id` is NULL for locally
/// authored cells. Remote change sets land through [`ChangeLogStore::merge_changes`],
/// which is transactional and idempotent.
pub struct ChangeLogStore {
    conn: Connection,
    hub: Arc<NotificationHub>,
    site_id: [u8; 16],
    path: Option<PathBuf>,
    shared_statements: BTreeSet<String>,
}

struct TableInfo {
    pk_column: String,
    /// Non-pk columns as (cid, name), cid being sqlite's own column index.
    columns: Vec<(i32, String)>,
}

impl ChangeLogStore {
    /// Open a file-backed store, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open store database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for change-log store")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open an ephemeral in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(INTERNAL_SCHEMA)
            .context("failed to initialize change-log schema")?;
        conn.set_prepared_statement_cache_capacity(128);

        let site_id: Option<Vec<u8>> = conn
            .query_row("SELECT site_id FROM _changelog_site LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        let site_id: [u8; 16] = match site_id {
            Some(bytes) => bytes
                .try_into()
                .map_err(|_| anyhow!("stored site id is not 16 bytes"))?,
            None => {
                let id = *uuid::Uuid::new_v4().as_bytes();
                conn.execute("INSERT INTO _changelog_site(site_id) VALUES (?1)", [id.to_vec()])?;
                id
            }
        };

        let hub = NotificationHub::new();
        let hook_hub = Arc::clone(&hub);
        conn.update_hook(Some(
            move |action, _db: &str, table: &str, _rowid: i64| {
                hook_hub.record(table, action);
            },
        ));

        Ok(Self {
            conn,
            hub,
            site_id,
            path,
            shared_statements: BTreeSet::new(),
        })
    }

    pub fn site_id(&self) -> [u8; 16] {
        self.site_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn notification_hub(&self) -> Arc<NotificationHub> {
        Arc::clone(&self.hub)
    }

    /// Highest db_version recorded so far; 0 for a fresh store.
    pub fn db_version(&self) -> Result<i64> {
        let version: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(db_version), 0) FROM _changelog_cells",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Stored schema metadata, if this store has had a schema applied.
    pub fn schema_meta(&self) -> Result<Option<(String, u32)>> {
        let name: Option<String> = self.meta_value("schema_name")?;
        let version: Option<String> = self.meta_value("schema_version")?;
        match (name, version) {
            (Some(name), Some(version)) => {
                let version = version
                    .parse::<u32>()
                    .context("stored schema_version is not an integer")?;
                Ok(Some((name, version)))
            }
            _ => Ok(None),
        }
    }

    /// Apply canonical schema DDL and persist the schema name/version
    /// metadata in one transaction. The DDL is expected to be additive
    /// (`CREATE TABLE IF NOT EXISTS` style) so reapplication migrates in
    /// place.
    pub fn apply_schema(&mut self, name: &str, version: u32, schema_sql: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(schema_sql)
            .context("failed to apply schema DDL")?;
        tx.execute(
            "INSERT INTO _changelog_meta(key, value) VALUES ('schema_name', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [name],
        )?;
        tx.execute(
            "INSERT INTO _changelog_meta(key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [version.to_string()],
        )?;
        tx.commit()?;
        self.hub.dispatch();
        Ok(())
    }

    fn meta_value(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM _changelog_meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Write (insert or update) a row, recording one change cell per
    /// touched column. Returns the db_version stamped on the write.
    pub fn put(&mut self, table: &str, pk: &Value, cols: &[(&str, Value)]) -> Result<i64> {
        validate_identifier(table)?;
        if cols.is_empty() {
            bail!("put on '{table}' requires at least one column");
        }
        let info = table_info(&self.conn, table)?;
        let pk_bytes = serde_json::to_vec(pk).expect("json value serializes");

        let tx = self.conn.transaction()?;
        let db_version = next_db_version(&tx)?;
        let causal_length = {
            let current = row_causal_length(&tx, table, &pk_bytes)?;
            match current {
                None => 1,
                Some(cl) if cl % 2 == 0 => cl + 1,
                Some(cl) => cl,
            }
        };

        // Materialize the row first so constraint failures abort before any
        // cells are recorded.
        let mut insert_cols = vec![quote_ident(&info.pk_column)];
        let mut bind_values = vec![json_to_sql(pk)];
        for (name, value) in cols {
            let _ = column_id(&info, name)
                .ok_or_else(|| anyhow!("table '{table}' has no column '{name}'"))?;
            insert_cols.push(quote_ident(name));
            bind_values.push(json_to_sql(value));
        }
        let placeholders: Vec<String> = (1..=bind_values.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = insert_cols[1..]
            .iter()
            .map(|col| format!("{col} = excluded.{col}"))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
            quote_ident(table),
            insert_cols.join(", "),
            placeholders.join(", "),
            quote_ident(&info.pk_column),
            updates.join(", "),
        );
        tx.execute(&sql, params_from_iter(bind_values.iter()))?;

        for (seq, (name, value)) in cols.iter().enumerate() {
            let cid = column_id(&info, name).expect("column checked above");
            let col_version = cell_col_version(&tx, table, &pk_bytes, cid)?.unwrap_or(0) + 1;
            upsert_cell(
                &tx,
                table,
                &pk_bytes,
                cid,
                value,
                col_version,
                db_version,
                None,
                causal_length,
                seq as i32,
            )?;
        }
        tx.commit()?;
        self.hub.dispatch();
        Ok(db_version)
    }

    /// Delete a row, recording a tombstone cell with an even causal length.
    pub fn delete_row(&mut self, table: &str, pk: &Value) -> Result<i64> {
        validate_identifier(table)?;
        let info = table_info(&self.conn, table)?;
        let pk_bytes = serde_json::to_vec(pk).expect("json value serializes");

        let tx = self.conn.transaction()?;
        let db_version = next_db_version(&tx)?;
        let causal_length = match row_causal_length(&tx, table, &pk_bytes)? {
            Some(cl) if cl % 2 == 1 => cl + 1,
            Some(cl) => cl,
            None => bail!("cannot delete unknown row from '{table}'"),
        };
        let col_version =
            cell_col_version(&tx, table, &pk_bytes, TOMBSTONE_CID)?.unwrap_or(0) + 1;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(table),
                quote_ident(&info.pk_column)
            ),
            [json_to_sql(pk)],
        )?;
        upsert_cell(
            &tx,
            table,
            &pk_bytes,
            TOMBSTONE_CID,
            &Value::Null,
            col_version,
            db_version,
            None,
            causal_length,
            0,
        )?;
        tx.commit()?;
        self.hub.dispatch();
        Ok(db_version)
    }

    /// Locally authored cells with `db_version > since`, ordered by
    /// `(db_version, seq)`. Cells merged in from other replicas carry the
    /// originator's site id and are excluded here.
    pub fn local_changes_since(&self, since: i64) -> Result<Vec<Change>> {
        self.select_changes(
            "SELECT tbl, pk, cid, value, col_version, db_version, site_id, causal_length, seq
             FROM _changelog_cells
             WHERE db_version > ?1 AND site_id IS NULL
             ORDER BY db_version ASC, seq ASC",
            params![since],
        )
    }

    /// Cells with `db_version > since` not originated by `exclude_site`.
    /// Used by the relay side so a replica never gets its own changes back.
    pub fn changes_since_excluding(&self, since: i64, exclude_site: &[u8; 16]) -> Result<Vec<Change>> {
        self.select_changes(
            "SELECT tbl, pk, cid, value, col_version, db_version, site_id, causal_length, seq
             FROM _changelog_cells
             WHERE db_version > ?1 AND (site_id IS NULL OR site_id != ?2)
             ORDER BY db_version ASC, seq ASC",
            params![since, exclude_site.to_vec()],
        )
    }

    fn select_changes(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Change>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let value_text: Option<String> = row.get(3)?;
            let site_id: Option<Vec<u8>> = row.get(6)?;
            let site_id = match site_id {
                Some(bytes) => Some(
                    bytes
                        .try_into()
                        .map_err(|_| anyhow!("stored site id is not 16 bytes"))?,
                ),
                None => None,
            };
            out.push(Change {
                table: row.get(0)?,
                pk: row.get(1)?,
                cid: row.get(2)?,
                value: match value_text {
                    Some(text) => serde_json::from_str(&text)
                        .context("stored cell value is not valid JSON")?,
                    None => Value::Null,
                },
                col_version: row.get(4)?,
                db_version: row.get(5)?,
                site_id,
                causal_length: row.get(7)?,
                seq: row.get(8)?,
            });
        }
        Ok(out)
    }

    /// Merge a change set in one all-or-nothing transaction.
    ///
    /// A cell is taken iff its `(causal_length, col_version)` pair is
    /// strictly greater than the stored pair, so replaying the same change
    /// set is a no-op. Applied cells are restamped with a fresh local
    /// db_version and keep the originator's site id (`default_sender`
    /// stands in for cells whose site id was implicit). Returns the number
    /// of cells applied.
    pub fn merge_changes(&mut self, changes: &[Change], default_sender: [u8; 16]) -> Result<usize> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut applied = 0usize;
        let tx = self.conn.transaction()?;
        let db_version = next_db_version(&tx)?;
        for change in changes {
            validate_identifier(&change.table)?;
            let info = table_info(&tx, &change.table)?;
            let row_cl = row_causal_length(&tx, &change.table, &change.pk)?.unwrap_or(0);
            if change.is_tombstone() {
                if change.causal_length <= row_cl {
                    continue;
                }
                let pk_value: Value = serde_json::from_slice(&change.pk)
                    .context("change primary key is not valid JSON")?;
                tx.execute(
                    &format!(
                        "DELETE FROM {} WHERE {} = ?1",
                        quote_ident(&change.table),
                        quote_ident(&info.pk_column)
                    ),
                    [json_to_sql(&pk_value)],
                )?;
            } else {
                // A locally deleted row swallows stale cells from before the
                // delete; only a strictly newer causal length resurrects it.
                if row_cl % 2 == 0 && row_cl > 0 && change.causal_length <= row_cl {
                    continue;
                }
                let stored = cell_versions(&tx, &change.table, &change.pk, change.cid)?;
                if let Some((stored_cl, stored_cv)) = stored {
                    if (change.causal_length, change.col_version) <= (stored_cl, stored_cv) {
                        continue;
                    }
                }
                let column = info
                    .columns
                    .iter()
                    .find(|(cid, _)| *cid == change.cid)
                    .map(|(_, name)| name.clone())
                    .ok_or_else(|| {
                        anyhow!("table '{}' has no column id {}", change.table, change.cid)
                    })?;
                let pk_value: Value = serde_json::from_slice(&change.pk)
                    .context("change primary key is not valid JSON")?;
                tx.execute(
                    &format!(
                        "INSERT INTO {} ({}) VALUES (?1) ON CONFLICT({}) DO NOTHING",
                        quote_ident(&change.table),
                        quote_ident(&info.pk_column),
                        quote_ident(&info.pk_column)
                    ),
                    [json_to_sql(&pk_value)],
                )?;
                tx.execute(
                    &format!(
                        "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                        quote_ident(&change.table),
                        quote_ident(&column),
                        quote_ident(&info.pk_column)
                    ),
                    params![json_to_sql(&change.value), json_to_sql(&pk_value)],
                )?;
            }
            upsert_cell(
                &tx,
                &change.table,
                &change.pk,
                change.cid,
                &change.value,
                change.col_version,
                db_version,
                Some(change.site_id.unwrap_or(default_sender)),
                change.causal_length,
                change.seq,
            )?;
            applied += 1;
        }
        tx.commit()?;
        self.hub.dispatch();
        tracing::debug!(applied, total = changes.len(), "merged change set");
        Ok(applied)
    }

    /// Distinct user tables a statement reads. See [`introspect::tables_used`].
    pub fn tables_used(&self, sql: &str) -> Result<BTreeSet<String>> {
        introspect::tables_used(&self.conn, sql)
    }

    /// Run a read-only query, mapping every column to a JSON value.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let column_count = stmt.column_count();
        let bind: Vec<rusqlite::types::Value> = params.iter().map(json_to_sql).collect();
        let mut rows = stmt.query(params_from_iter(bind.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                record.push(sql_to_json(row.get_ref(idx)?));
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Validate and cache a prepared statement for shared use. Repeat calls
    /// for the same SQL hit sqlite's statement cache.
    pub fn prepare_shared(&mut self, sql: &str) -> Result<()> {
        self.conn
            .prepare_cached(sql)
            .with_context(|| format!("failed to prepare shared statement: {sql}"))?;
        self.shared_statements.insert(sql.to_string());
        Ok(())
    }

    /// Release a shared statement. The underlying handle is reclaimed by
    /// sqlite's statement cache.
    pub fn finalize_shared(&mut self, sql: &str) {
        self.shared_statements.remove(sql);
    }

    pub fn shared_statement_count(&self) -> usize {
        self.shared_statements.len()
    }
}

fn next_db_version(conn: &Connection) -> Result<i64> {
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(db_version), 0) FROM _changelog_cells",
        [],
        |row| row.get(0),
    )?;
    Ok(current + 1)
}

fn row_causal_length(conn: &Connection, table: &str, pk: &[u8]) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT MAX(causal_length) FROM _changelog_cells WHERE tbl = ?1 AND pk = ?2",
        params![table, pk],
        |row| row.get::<_, Option<i64>>(0),
    )
    .optional()
    .map(Option::flatten)
    .map_err(Into::into)
}

fn cell_col_version(conn: &Connection, table: &str, pk: &[u8], cid: i32) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT col_version FROM _changelog_cells WHERE tbl = ?1 AND pk = ?2 AND cid = ?3",
        params![table, pk, cid],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

fn cell_versions(
    conn: &Connection,
    table: &str,
    pk: &[u8],
    cid: i32,
) -> Result<Option<(i64, i64)>> {
    conn.query_row(
        "SELECT causal_length, col_version FROM _changelog_cells
         WHERE tbl = ?1 AND pk = ?2 AND cid = ?3",
        params![table, pk, cid],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(Into::into)
}

#[allow(clippy::too_many_arguments)]
fn upsert_cell(
    conn: &Connection,
    table: &str,
    pk: &[u8],
    cid: i32,
    value: &Value,
    col_version: i64,
    db_version: i64,
    site_id: Option<[u8; 16]>,
    causal_length: i64,
    seq: i32,
) -> Result<()> {
    conn.execute(
        "INSERT INTO _changelog_cells(tbl, pk, cid, value, col_version, db_version, site_id, causal_length, seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(tbl, pk, cid) DO UPDATE SET
            value = excluded.value,
            col_version = excluded.col_version,
            db_version = excluded.db_version,
            site_id = excluded.site_id,
            causal_length = excluded.causal_length,
            seq = excluded.seq",
        params![
            table,
            pk,
            cid,
            serde_json::to_string(value).expect("json value serializes"),
            col_version,
            db_version,
            site_id.map(|id| id.to_vec()),
            causal_length,
            seq,
        ],
    )?;
    Ok(())
}

fn table_info(conn: &Connection, table: &str) -> Result<TableInfo> {
    let mut stmt = conn.prepare_cached(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let mut rows = stmt.query([])?;
    let mut pk_column = None;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        let cid: i32 = row.get(0)?;
        let name: String = row.get(1)?;
        let is_pk: i32 = row.get(5)?;
        if is_pk > 0 {
            pk_column = Some(name);
        } else {
            columns.push((cid, name));
        }
    }
    let pk_column = pk_column.ok_or_else(|| {
        anyhow!("table '{table}' does not exist or has no primary key column")
    })?;
    Ok(TableInfo { pk_column, columns })
}

fn column_id(info: &TableInfo, name: &str) -> Option<i32> {
    info.columns
        .iter()
        .find(|(_, col)| col == name)
        .map(|(cid, _)| *cid)
}

/// Validate a table identifier before it is spliced into SQL text.
fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() || identifier.len() > 63 {
        bail!("invalid identifier '{identifier}'");
    }
    let mut chars = identifier.chars();
    let first = chars.next().expect("non-empty");
    if !first.is_ascii_alphabetic() && first != '_' {
        bail!("identifier '{identifier}' must start with a letter or underscore");
    }
    if identifier.chars().any(|c| !c.is_ascii_alphanumeric() && c != '_') {
        bail!("identifier '{identifier}' contains invalid characters");
    }
    Ok(())
}

fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(serde_json::to_string(other).expect("json value serializes")),
    }
}

fn sql_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}
