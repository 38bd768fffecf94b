//! Snapshot engine.
//!
//! Drains raw trigger output into stamped oplog entries under a serializing
//! mutex. Every entry in one snapshot gets the same timestamp, monotone and
//! never less than the prior snapshot's. Shadow rows are updated as entries
//! are stamped: inserts and updates replace the tag set with the freshly
//! generated tag, deletes remove the shadow row.
//!
//! Snapshots are independent of connection state; they run against the
//! local database whether or not replication is up.

use crate::adapter::DbAdapter;
use crate::notifier::{DataChangeNotification, Notifier, TableChange};
use crate::store::OplogStore;
use parking_lot::Mutex;
use satellite_core::{
    OpType, OplogEntry, Relations, SatelliteError, SatelliteResult, ShadowEntry, SqlValue, Tag,
    TagSet,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// The result of one snapshot pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotOutcome {
    /// The timestamp assigned to every entry in this snapshot, or `None`
    /// when there was nothing to process.
    pub timestamp: Option<i64>,
    /// The stamped entries, in rowid order.
    pub entries: Vec<OplogEntry>,
}

impl SnapshotOutcome {
    /// Returns true if the snapshot processed no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Converts raw trigger captures into stamped oplog entries.
pub struct SnapshotEngine<A: DbAdapter> {
    store: Arc<OplogStore<A>>,
    notifier: Arc<Notifier>,
    client_id: String,
    relations: Relations,
    polling_interval: Duration,
    min_snapshot_window: Duration,
    mutex: Mutex<()>,
    last_timestamp: AtomicI64,
    pending: AtomicBool,
    last_run: Mutex<Option<Instant>>,
}

impl<A: DbAdapter> SnapshotEngine<A> {
    /// Creates a snapshot engine.
    pub fn new(
        store: Arc<OplogStore<A>>,
        notifier: Arc<Notifier>,
        client_id: impl Into<String>,
        relations: Relations,
        polling_interval: Duration,
        min_snapshot_window: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            client_id: client_id.into(),
            relations,
            polling_interval,
            min_snapshot_window,
            mutex: Mutex::new(()),
            last_timestamp: AtomicI64::new(0),
            pending: AtomicBool::new(false),
            last_run: Mutex::new(None),
        }
    }

    /// Marks the database as potentially changed so the next tick
    /// snapshots without waiting for the polling interval.
    ///
    /// This is the throttled path: callers arriving while a snapshot is in
    /// flight coalesce onto the next one instead of failing.
    pub fn request_snapshot(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    /// Drives the snapshot timer.
    ///
    /// Runs a snapshot when the polling interval has elapsed, or when one
    /// was requested and the coalescing window has passed. Returns the
    /// outcome if a snapshot ran.
    pub fn tick(&self, now: Instant) -> SatelliteResult<Option<SnapshotOutcome>> {
        let due = {
            let last_run = self.last_run.lock();
            let elapsed = last_run.map(|at| now.duration_since(at));
            match elapsed {
                None => true,
                Some(elapsed) => {
                    elapsed >= self.polling_interval
                        || (self.pending.load(Ordering::SeqCst)
                            && elapsed >= self.min_snapshot_window)
                }
            }
        };

        if !due {
            return Ok(None);
        }
        self.perform_snapshot(now).map(Some)
    }

    /// Runs one snapshot pass.
    ///
    /// Fails with an internal error if a snapshot is already in flight; use
    /// [`request_snapshot`](Self::request_snapshot) to coalesce instead.
    pub fn perform_snapshot(&self, now: Instant) -> SatelliteResult<SnapshotOutcome> {
        let _guard = self
            .mutex
            .try_lock()
            .ok_or_else(|| SatelliteError::internal("already performing snapshot"))?;

        self.pending.store(false, Ordering::SeqCst);

        let outcome = self.store.adapter().transaction(|_| self.snapshot_locked())?;

        *self.last_run.lock() = Some(now);

        if !outcome.is_empty() {
            self.notifier.emit_data_changes(DataChangeNotification {
                origin: self.client_id.clone(),
                changes: table_changes(&outcome.entries),
            });
        }
        Ok(outcome)
    }

    fn snapshot_locked(&self) -> SatelliteResult<SnapshotOutcome> {
        let mut entries = self.store.unprocessed_entries()?;
        if entries.is_empty() {
            return Ok(SnapshotOutcome {
                timestamp: None,
                entries: Vec::new(),
            });
        }

        let timestamp = self.next_timestamp();
        debug!(count = entries.len(), timestamp, "taking snapshot");

        self.nullify_post_delete_inserts(&mut entries);

        for entry in &mut entries {
            let table = entry.qualified_table();
            let shadow = self.store.get_shadow(&table, &entry.primary_key)?;
            let shadow_tags = shadow.map(|s| s.tags).unwrap_or_default();
            let new_tag = Tag::generate(&self.client_id, timestamp);

            match entry.optype {
                OpType::Insert | OpType::Compensation => {
                    entry.clear_tags = TagSet::singleton(new_tag.clone()).encode();
                    self.store.upsert_shadow(&ShadowEntry::new(
                        entry.namespace.clone(),
                        entry.tablename.clone(),
                        entry.primary_key.clone(),
                        TagSet::singleton(new_tag),
                    ))?;
                }
                OpType::Update | OpType::Upsert => {
                    let mut clear = shadow_tags;
                    clear.insert(new_tag.clone());
                    entry.clear_tags = clear.encode();
                    self.store.upsert_shadow(&ShadowEntry::new(
                        entry.namespace.clone(),
                        entry.tablename.clone(),
                        entry.primary_key.clone(),
                        TagSet::singleton(new_tag),
                    ))?;
                }
                OpType::Delete => {
                    let mut clear = shadow_tags;
                    clear.insert(new_tag);
                    entry.clear_tags = clear.encode();
                    self.store.delete_shadow(&table, &entry.primary_key)?;
                }
                OpType::Gone => {
                    return Err(SatelliteError::internal(
                        "trigger capture produced a GONE entry",
                    ));
                }
            }

            entry.timestamp = Some(timestamp);
            self.store.stamp_entry(entry)?;
        }

        Ok(SnapshotOutcome {
            timestamp: Some(timestamp),
            entries,
        })
    }

    /// Rewrites an insert that follows a delete on the same primary key
    /// within this window: columns the new insert did not supply become
    /// explicit nulls instead of inheriting pre-delete values.
    fn nullify_post_delete_inserts(&self, entries: &mut [OplogEntry]) {
        let mut deleted: BTreeSet<(String, String, String)> = BTreeSet::new();

        for entry in entries.iter_mut() {
            let key = (
                entry.namespace.clone(),
                entry.tablename.clone(),
                entry.primary_key.clone(),
            );
            match entry.optype {
                OpType::Delete => {
                    deleted.insert(key);
                }
                OpType::Insert => {
                    if !deleted.remove(&key) {
                        continue;
                    }
                    let Some(relation) = self.relations.get(&entry.qualified_table()) else {
                        continue;
                    };
                    if let Some(new_row) = &mut entry.new_row {
                        for column in relation.column_names() {
                            new_row
                                .entry(column.to_string())
                                .or_insert(SqlValue::Null);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn next_timestamp(&self) -> i64 {
        let now = now_millis();
        self.last_timestamp
            .fetch_max(now, Ordering::SeqCst)
            .max(now)
    }
}

/// Current wall clock in UTC milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn table_changes(entries: &[OplogEntry]) -> Vec<TableChange> {
    let mut grouped: BTreeMap<satellite_core::QualifiedTablename, Vec<i64>> = BTreeMap::new();
    for entry in entries {
        grouped
            .entry(entry.qualified_table())
            .or_default()
            .push(entry.rowid);
    }
    grouped
        .into_iter()
        .map(|(table, rowids)| TableChange {
            record_changes: rowids.len(),
            table,
            rowids,
        })
        .collect()
}
