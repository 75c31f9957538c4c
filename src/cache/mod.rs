// ABOUTME: Reactive query cache - dedupes live queries and invalidates on table changes
// ABOUTME: One prepared statement and one set of table subscriptions per distinct SQL text

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use serde_json::Value;

use sqlite_changelog::{ChangeLogStore, NotificationHub, SubscriptionGuard};

use crate::error::SyncError;

pub type SharedStore = Arc<StdMutex<ChangeLogStore>>;

/// Set of sqlite update codes a subscriber cares about
/// (insert = 18, update = 23, delete = 9).
pub type UpdateMask = BTreeSet<i32>;

pub type InvalidateFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Lifecycle events for a live-query entry, driven by the caller on
/// mount/unmount. The whole state machine lives in [`QueryCache::apply`].
pub enum QueryEvent {
    /// A subscription object was created; no executor has run yet.
    Added,
    /// An active consumer attached.
    ObserverAdded {
        mask: UpdateMask,
        on_invalidate: InvalidateFn,
    },
    /// An active consumer detached; others may remain.
    ObserverRemoved { observer: ObserverId },
    /// The subscription object itself was evicted.
    Removed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub statements_prepared: u64,
    pub introspections: u64,
    pub race_discards: u64,
    pub invalidations: u64,
}

#[derive(Debug, Clone)]
pub struct EntryStats {
    pub total_refs: usize,
    pub active_refs: usize,
    pub listening: bool,
    pub has_statement: bool,
    pub tables_used: Option<BTreeSet<String>>,
    pub fresh: bool,
}

struct Subscriber {
    mask: UpdateMask,
    on_invalidate: InvalidateFn,
}

struct QueryEntry {
    total_refs: usize,
    active_refs: usize,
    statement: bool,
    tables_used: Option<BTreeSet<String>>,
    listening: bool,
    generation: u64,
    fresh: bool,
    result: Option<(Vec<Value>, Vec<Vec<Value>>)>,
    subscribers: HashMap<ObserverId, Subscriber>,
}

impl QueryEntry {
    fn new() -> Self {
        Self {
            total_refs: 0,
            active_refs: 0,
            statement: false,
            tables_used: None,
            listening: false,
            generation: 0,
            fresh: false,
            result: None,
            subscribers: HashMap::new(),
        }
    }
}

struct TableEntry {
    queries: BTreeSet<String>,
    _guard: SubscriptionGuard,
}

struct CacheState {
    entries: HashMap<String, QueryEntry>,
    tables: HashMap<String, TableEntry>,
    /// Introspection results keyed by SQL text, computed at most once.
    introspected: HashMap<String, BTreeSet<String>>,
    next_observer: u64,
    metrics: CacheMetrics,
}

/// Multiplexes many live queries over shared prepared statements and
/// table-level change subscriptions for one database.
///
/// Invalidation callbacks run synchronously from the store's notification
/// dispatch; they must be lightweight and must not re-enter the store.
pub struct QueryCache {
    db: String,
    store: SharedStore,
    hub: Arc<NotificationHub>,
    state: StdMutex<CacheState>,
}

impl QueryCache {
    pub fn new(db: impl Into<String>, store: SharedStore) -> Arc<Self> {
        let hub = {
            let store = store.lock().expect("replica store poisoned");
            store.notification_hub()
        };
        Arc::new(Self {
            db: db.into(),
            store,
            hub,
            state: StdMutex::new(CacheState {
                entries: HashMap::new(),
                tables: HashMap::new(),
                introspected: HashMap::new(),
                next_observer: 0,
                metrics: CacheMetrics::default(),
            }),
        })
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn added(self: &Arc<Self>, sql: &str) {
        self.apply(sql, QueryEvent::Added);
    }

    pub fn observer_added(
        self: &Arc<Self>,
        sql: &str,
        mask: UpdateMask,
        on_invalidate: InvalidateFn,
    ) -> ObserverId {
        self.apply(sql, QueryEvent::ObserverAdded { mask, on_invalidate })
            .expect("observer-added returns an id")
    }

    pub fn observer_removed(self: &Arc<Self>, sql: &str, observer: ObserverId) {
        self.apply(sql, QueryEvent::ObserverRemoved { observer });
    }

    pub fn removed(self: &Arc<Self>, sql: &str) {
        self.apply(sql, QueryEvent::Removed);
    }

    /// Single transition function for the entry state machine.
    pub fn apply(self: &Arc<Self>, sql: &str, event: QueryEvent) -> Option<ObserverId> {
        let sql = normalize_sql(sql);
        match event {
            QueryEvent::Added => {
                let mut state = self.state.lock().expect("query cache poisoned");
                state
                    .entries
                    .entry(sql)
                    .or_insert_with(QueryEntry::new)
                    .total_refs += 1;
                None
            }
            QueryEvent::ObserverAdded { mask, on_invalidate } => {
                let mut needs_statement = false;
                let mut introspect_generation = None;
                let observer = {
                    let mut state = self.state.lock().expect("query cache poisoned");
                    let observer = ObserverId(state.next_observer);
                    state.next_observer += 1;

                    let cached_tables = state.introspected.get(&sql).cloned();
                    let entry = state.entries.entry(sql.clone()).or_insert_with(|| {
                        // Tolerate an observer attaching to an entry that was
                        // never announced; it counts as one reference.
                        let mut entry = QueryEntry::new();
                        entry.total_refs = 1;
                        entry
                    });
                    entry
                        .subscribers
                        .insert(observer, Subscriber { mask, on_invalidate });
                    entry.active_refs += 1;

                    let mut bind_now = None;
                    if entry.active_refs == 1 {
                        entry.listening = true;
                        entry.generation += 1;
                        if !entry.statement {
                            entry.statement = true;
                            needs_statement = true;
                        }
                        match cached_tables {
                            Some(tables) => {
                                entry.tables_used = Some(tables.clone());
                                bind_now = Some(tables);
                            }
                            None => introspect_generation = Some(entry.generation),
                        }
                    }
                    if needs_statement {
                        state.metrics.statements_prepared += 1;
                    }
                    if let Some(tables) = bind_now {
                        Self::bind_tables(self, &mut state, &sql, &tables);
                    }
                    observer
                };

                // Statement preparation and table discovery both go through
                // the store outside the cache lock.
                if needs_statement {
                    self.prepare_statement(&sql);
                }
                if let Some(generation) = introspect_generation {
                    self.start_introspection(&sql, generation);
                }
                Some(observer)
            }
            QueryEvent::ObserverRemoved { observer } => {
                let finalize = {
                    let mut state = self.state.lock().expect("query cache poisoned");
                    let Some(entry) = state.entries.get_mut(&sql) else {
                        return None;
                    };
                    entry.subscribers.remove(&observer);
                    entry.active_refs = entry.active_refs.saturating_sub(1);
                    if entry.active_refs > 0 {
                        return None;
                    }
                    // Last active consumer gone: go quiet but keep the entry
                    // around for a transient remount.
                    entry.listening = false;
                    entry.fresh = false;
                    entry.result = None;
                    let finalize = entry.statement;
                    entry.statement = false;
                    let tables = entry.tables_used.clone();
                    if let Some(tables) = tables {
                        Self::unbind_tables(&mut state, &sql, &tables);
                    }
                    finalize
                };
                if finalize {
                    let mut store = self.store.lock().expect("replica store poisoned");
                    store.finalize_shared(&sql);
                }
                None
            }
            QueryEvent::Removed => {
                let finalize = {
                    let mut state = self.state.lock().expect("query cache poisoned");
                    let Some(entry) = state.entries.get_mut(&sql) else {
                        return None;
                    };
                    entry.total_refs = entry.total_refs.saturating_sub(1);
                    if entry.total_refs > 0 {
                        return None;
                    }
                    let finalize = entry.statement;
                    let tables = entry.tables_used.clone();
                    state.entries.remove(&sql);
                    if let Some(tables) = tables {
                        Self::unbind_tables(&mut state, &sql, &tables);
                    }
                    finalize
                };
                if finalize {
                    let mut store = self.store.lock().expect("replica store poisoned");
                    store.finalize_shared(&sql);
                }
                None
            }
        }
    }

    /// Execute the query, serving the cached result while it is fresh.
    pub fn fetch(&self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>, SyncError> {
        let sql = normalize_sql(sql);
        {
            let state = self.state.lock().expect("query cache poisoned");
            if let Some(entry) = state.entries.get(&sql) {
                if entry.fresh {
                    // The cached result only serves consumers with the same
                    // bind parameters.
                    if let Some((cached_params, rows)) = &entry.result {
                        if cached_params == params {
                            return Ok(rows.clone());
                        }
                    }
                }
            }
        }
        let rows = {
            let store = self.store.lock().expect("replica store poisoned");
            store.query(&sql, params).map_err(SyncError::Storage)?
        };
        let mut state = self.state.lock().expect("query cache poisoned");
        if let Some(entry) = state.entries.get_mut(&sql) {
            entry.result = Some((params.to_vec(), rows.clone()));
            entry.fresh = true;
        }
        Ok(rows)
    }

    pub fn entry_stats(&self, sql: &str) -> Option<EntryStats> {
        let sql = normalize_sql(sql);
        let state = self.state.lock().expect("query cache poisoned");
        state.entries.get(&sql).map(|entry| EntryStats {
            total_refs: entry.total_refs,
            active_refs: entry.active_refs,
            listening: entry.listening,
            has_statement: entry.statement,
            tables_used: entry.tables_used.clone(),
            fresh: entry.fresh,
        })
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.state.lock().expect("query cache poisoned").metrics
    }

    fn prepare_statement(&self, sql: &str) {
        let mut store = self.store.lock().expect("replica store poisoned");
        if let Err(err) = store.prepare_shared(sql) {
            tracing::warn!(sql, %err, "failed to prepare shared statement");
        }
    }

    /// Kick off the asynchronous table discovery for a newly-listening
    /// entry. The result is only bound if the entry's generation still
    /// matches when it lands.
    fn start_introspection(self: &Arc<Self>, sql: &str, generation: u64) {
        {
            let mut state = self.state.lock().expect("query cache poisoned");
            state.metrics.introspections += 1;
        }
        let cache = Arc::clone(self);
        let sql = sql.to_string();
        tokio::spawn(async move {
            let tables = {
                let store = cache.store.lock().expect("replica store poisoned");
                store.tables_used(&sql)
            };
            match tables {
                Ok(tables) => cache.introspection_complete(&sql, generation, tables),
                Err(err) => {
                    // The query simply stays un-invalidated until the next
                    // active attach retries discovery.
                    tracing::warn!(sql = %sql, %err, "table introspection failed");
                }
            }
        });
    }

    /// Bind a discovery result to its entry, unless the entry raced into
    /// an inactive state while the lookup was in flight.
    fn introspection_complete(
        self: &Arc<Self>,
        sql: &str,
        generation: u64,
        tables: BTreeSet<String>,
    ) {
        let mut state = self.state.lock().expect("query cache poisoned");
        let Some(entry) = state.entries.get_mut(sql) else {
            state.metrics.race_discards += 1;
            return;
        };
        if !entry.listening || entry.generation != generation {
            state.metrics.race_discards += 1;
            return;
        }
        entry.tables_used = Some(tables.clone());
        state.introspected.insert(sql.to_string(), tables.clone());
        Self::bind_tables(self, &mut state, sql, &tables);
    }

    fn bind_tables(self: &Arc<Self>, state: &mut CacheState, sql: &str, tables: &BTreeSet<String>) {
        for table in tables {
            if let Some(existing) = state.tables.get_mut(table) {
                existing.queries.insert(sql.to_string());
                continue;
            }
            let weak: Weak<QueryCache> = Arc::downgrade(self);
            let fired_table = table.clone();
            let guard = self.hub.subscribe(
                table,
                Arc::new(move |codes: &[i32]| {
                    if let Some(cache) = weak.upgrade() {
                        cache.table_fired(&fired_table, codes);
                    }
                }),
            );
            let mut queries = BTreeSet::new();
            queries.insert(sql.to_string());
            state.tables.insert(
                table.clone(),
                TableEntry {
                    queries,
                    _guard: guard,
                },
            );
        }
    }

    fn unbind_tables(state: &mut CacheState, sql: &str, tables: &BTreeSet<String>) {
        for table in tables {
            let empty = match state.tables.get_mut(table) {
                Some(entry) => {
                    entry.queries.remove(sql);
                    entry.queries.is_empty()
                }
                None => false,
            };
            if empty {
                // Dropping the guard tears the store subscription down.
                state.tables.remove(table);
            }
        }
    }

    /// Table-level callback: fan out to each registered query's
    /// subscribers, testing every subscriber's own mask against the fired
    /// update types.
    fn table_fired(&self, table: &str, codes: &[i32]) {
        let to_invalidate: Vec<InvalidateFn> = {
            let mut state = self.state.lock().expect("query cache poisoned");
            let Some(table_entry) = state.tables.get(table) else {
                return;
            };
            let queries: Vec<String> = table_entry.queries.iter().cloned().collect();
            let mut callbacks = Vec::new();
            for sql in queries {
                let Some(entry) = state.entries.get_mut(&sql) else {
                    continue;
                };
                if !entry.listening {
                    continue;
                }
                entry.fresh = false;
                for subscriber in entry.subscribers.values() {
                    if codes.iter().any(|code| subscriber.mask.contains(code)) {
                        callbacks.push(Arc::clone(&subscriber.on_invalidate));
                    }
                }
            }
            state.metrics.invalidations += callbacks.len() as u64;
            callbacks
        };
        for callback in to_invalidate {
            callback();
        }
    }
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS test (
        id INTEGER PRIMARY KEY,
        content TEXT,
        position INTEGER
    );";

    const QUERY: &str = "SELECT id, content, position FROM test ORDER BY position, id";

    fn test_store() -> SharedStore {
        let mut store = ChangeLogStore::open_in_memory().unwrap();
        store.apply_schema("todo", 1, SCHEMA).unwrap();
        Arc::new(StdMutex::new(store))
    }

    fn mask(codes: &[i32]) -> UpdateMask {
        codes.iter().copied().collect()
    }

    fn noop() -> InvalidateFn {
        Arc::new(|| {})
    }

    #[test]
    fn normalization_collapses_whitespace() {
        assert_eq!(
            normalize_sql("SELECT  id\n  FROM test"),
            "SELECT id FROM test"
        );
    }

    #[tokio::test]
    async fn added_and_removed_track_total_refs() {
        let cache = QueryCache::new("main", test_store());
        cache.added(QUERY);
        cache.added(QUERY);
        assert_eq!(cache.entry_stats(QUERY).unwrap().total_refs, 2);
        cache.removed(QUERY);
        assert_eq!(cache.entry_stats(QUERY).unwrap().total_refs, 1);
        cache.removed(QUERY);
        assert!(cache.entry_stats(QUERY).is_none());
    }

    #[tokio::test]
    async fn statement_is_prepared_once_for_shared_sql() {
        let store = test_store();
        let cache = QueryCache::new("main", Arc::clone(&store));
        cache.added(QUERY);
        let a = cache.observer_added(QUERY, mask(&[18]), noop());
        let b = cache.observer_added(QUERY, mask(&[18]), noop());
        let c = cache.observer_added(QUERY, mask(&[18]), noop());

        let stats = cache.entry_stats(QUERY).unwrap();
        assert_eq!(stats.active_refs, 3);
        assert!(stats.listening);
        assert_eq!(cache.metrics().statements_prepared, 1);
        assert_eq!(cache.metrics().introspections, 1);
        assert_eq!(store.lock().unwrap().shared_statement_count(), 1);

        cache.observer_removed(QUERY, a);
        cache.observer_removed(QUERY, b);
        cache.observer_removed(QUERY, c);
        assert_eq!(store.lock().unwrap().shared_statement_count(), 0);
        assert!(!cache.entry_stats(QUERY).unwrap().listening);
    }

    #[tokio::test]
    async fn stale_generation_results_are_discarded() {
        let cache = QueryCache::new("main", test_store());
        cache.added(QUERY);
        let observer = cache.observer_added(QUERY, mask(&[18]), noop());

        // A result from a superseded lookup must not be stored.
        let mut stale: BTreeSet<String> = BTreeSet::new();
        stale.insert("wrong_table".to_string());
        cache.introspection_complete(&normalize_sql(QUERY), 0, stale);
        assert_eq!(cache.metrics().race_discards, 1);
        let tables = cache.entry_stats(QUERY).unwrap().tables_used;
        assert!(tables.map_or(true, |tables| !tables.contains("wrong_table")));

        cache.observer_removed(QUERY, observer);
    }

    #[tokio::test]
    async fn results_after_unmount_are_discarded() {
        let cache = QueryCache::new("main", test_store());
        cache.added(QUERY);
        let observer = cache.observer_added(QUERY, mask(&[18]), noop());
        let generation = 1;
        cache.observer_removed(QUERY, observer);

        let mut tables = BTreeSet::new();
        tables.insert("test".to_string());
        cache.introspection_complete(&normalize_sql(QUERY), generation, tables);
        assert!(cache.metrics().race_discards >= 1);
        assert_eq!(cache.entry_stats(QUERY).unwrap().tables_used, None);
    }

    #[tokio::test]
    async fn fetch_serves_cached_rows_only_for_matching_params() {
        let store = test_store();
        let cache = QueryCache::new("main", Arc::clone(&store));
        store
            .lock()
            .unwrap()
            .put("test", &json!(1), &[("content", json!("one")), ("position", json!(0))])
            .unwrap();
        store
            .lock()
            .unwrap()
            .put("test", &json!(2), &[("content", json!("two")), ("position", json!(1))])
            .unwrap();

        let sql = "SELECT content FROM test WHERE position >= ?1 ORDER BY position";
        cache.added(sql);
        let _observer = cache.observer_added(sql, mask(&[18]), noop());

        let wide = cache.fetch(sql, &[json!(0)]).unwrap();
        assert_eq!(wide.len(), 2);
        // Different bind parameters must not reuse the cached rows.
        let narrow = cache.fetch(sql, &[json!(1)]).unwrap();
        assert_eq!(narrow, vec![vec![json!("two")]]);
    }
}
