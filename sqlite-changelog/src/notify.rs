use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use rusqlite::hooks::Action;

/// SQLite operation codes as reported to the update hook.
pub const UPDATE_INSERT: i32 = 18;
pub const UPDATE_UPDATE: i32 = 23;
pub const UPDATE_DELETE: i32 = 9;

pub type TableCallback = Arc<dyn Fn(&[i32]) + Send + Sync>;

/// Fans table-level change events out to subscribers.
///
/// The store's update hook records `(table, op code)` pairs while a write
/// runs; after the write completes the store calls [`NotificationHub::dispatch`],
/// which delivers each table's deduplicated set of fired codes to that
/// table's subscribers. Callbacks must be lightweight and must not
/// synchronously re-enter the store.
pub struct NotificationHub {
    inner: Mutex<HubState>,
}

struct HubState {
    next_id: u64,
    subscribers: HashMap<String, HashMap<u64, TableCallback>>,
    pending: HashMap<String, BTreeSet<i32>>,
}

impl NotificationHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubState {
                next_id: 0,
                subscribers: HashMap::new(),
                pending: HashMap::new(),
            }),
        })
    }

    /// Called from the sqlite update hook. Internal bookkeeping tables are
    /// not surfaced to subscribers.
    pub(crate) fn record(&self, table: &str, action: Action) {
        if table.starts_with("_changelog_") || table.starts_with("sqlite_") {
            return;
        }
        let code = match action {
            Action::SQLITE_INSERT => UPDATE_INSERT,
            Action::SQLITE_UPDATE => UPDATE_UPDATE,
            Action::SQLITE_DELETE => UPDATE_DELETE,
            _ => return,
        };
        let mut inner = self.inner.lock().expect("notification hub poisoned");
        inner.pending.entry(table.to_string()).or_default().insert(code);
    }

    /// Drain pending events and invoke subscriber callbacks. Callbacks run
    /// outside the hub lock so they may subscribe/unsubscribe reentrantly.
    pub fn dispatch(&self) {
        let fired: Vec<(String, Vec<i32>, Vec<TableCallback>)> = {
            let mut inner = self.inner.lock().expect("notification hub poisoned");
            let pending = std::mem::take(&mut inner.pending);
            pending
                .into_iter()
                .filter_map(|(table, codes)| {
                    let callbacks: Vec<TableCallback> = inner
                        .subscribers
                        .get(&table)?
                        .values()
                        .cloned()
                        .collect();
                    if callbacks.is_empty() {
                        return None;
                    }
                    Some((table, codes.into_iter().collect(), callbacks))
                })
                .collect()
        };
        for (table, codes, callbacks) in fired {
            tracing::trace!(table = %table, ?codes, "dispatching table change");
            for callback in callbacks {
                callback(&codes);
            }
        }
    }

    pub fn subscribe(self: &Arc<Self>, table: &str, callback: TableCallback) -> SubscriptionGuard {
        let id = {
            let mut inner = self.inner.lock().expect("notification hub poisoned");
            let id = inner.next_id;
            inner.next_id += 1;
            inner
                .subscribers
                .entry(table.to_string())
                .or_default()
                .insert(id, callback);
            id
        };
        SubscriptionGuard {
            hub: Arc::clone(self),
            table: table.to_string(),
            id,
        }
    }

    fn unsubscribe(&self, table: &str, id: u64) {
        let mut inner = self.inner.lock().expect("notification hub poisoned");
        if let Some(subs) = inner.subscribers.get_mut(table) {
            subs.remove(&id);
            if subs.is_empty() {
                inner.subscribers.remove(table);
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, table: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.subscribers.get(table).map_or(0, HashMap::len)
    }
}

/// Unsubscribes on drop.
pub struct SubscriptionGuard {
    hub: Arc<NotificationHub>,
    table: String,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.table, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatch_dedupes_codes_per_table() {
        let hub = NotificationHub::new();
        let seen: Arc<Mutex<Vec<Vec<i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let _guard = hub.subscribe(
            "prices",
            Arc::new(move |codes| seen_cb.lock().unwrap().push(codes.to_vec())),
        );

        hub.record("prices", Action::SQLITE_INSERT);
        hub.record("prices", Action::SQLITE_INSERT);
        hub.record("prices", Action::SQLITE_UPDATE);
        hub.dispatch();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec![UPDATE_INSERT, UPDATE_UPDATE]);
    }

    #[test]
    fn internal_tables_are_ignored() {
        let hub = NotificationHub::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let _guard = hub.subscribe(
            "_changelog_cells",
            Arc::new(move |_| {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        hub.record("_changelog_cells", Action::SQLITE_INSERT);
        hub.dispatch();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn guard_drop_unsubscribes() {
        let hub = NotificationHub::new();
        let guard = hub.subscribe("stuff", Arc::new(|_| {}));
        assert_eq!(hub.subscriber_count("stuff"), 1);
        drop(guard);
        assert_eq!(hub.subscriber_count("stuff"), 0);
    }
}
