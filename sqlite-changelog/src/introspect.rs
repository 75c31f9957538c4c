use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::Connection;

/// Discover the distinct user tables a SQL statement reads.
///
/// Preparing a statement drives the sqlite authorizer, which reports a
/// `Read` action per accessed column; the table names are collected from
/// those callbacks. Internal bookkeeping tables and sqlite's own catalog
/// tables are excluded.
pub fn tables_used(conn: &Connection, sql: &str) -> Result<BTreeSet<String>> {
    let seen: Arc<Mutex<BTreeSet<String>>> = Arc::new(Mutex::new(BTreeSet::new()));
    let recorder = Arc::clone(&seen);
    conn.authorizer(Some(move |ctx: AuthContext<'_>| {
        if let AuthAction::Read { table_name, .. } = ctx.action {
            if !table_name.starts_with("_changelog_") && !table_name.starts_with("sqlite_") {
                recorder
                    .lock()
                    .expect("introspection set poisoned")
                    .insert(table_name.to_string());
            }
        }
        Authorization::Allow
    }));

    let prepared = conn.prepare(sql);
    conn.authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
    prepared.with_context(|| format!("failed to prepare statement for introspection: {sql}"))?;

    let tables = seen.lock().expect("introspection set poisoned").clone();
    Ok(tables)
}
