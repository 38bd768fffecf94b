//! Merge engine.
//!
//! Pure resolution of concurrent local and incoming operations on the same
//! primary keys. Per column the value with the greater timestamp wins; on a
//! tie the incoming value wins. Tag sets decide life and death of the row:
//! a row whose merged tag set is empty is deleted.
//!
//! The merged tag set is computed per side: tags contributed locally survive
//! unless the incoming side cleared them, and vice versa. Folding both sides
//! through a global union-minus-union would let an operation cancel its own
//! tag, so the subtraction is strictly cross-side.

use crate::error::{SatelliteError, SatelliteResult};
use crate::oplog::{OplogEntry, OpType};
use crate::tags::{Tag, TagSet};
use crate::types::{QualifiedTablename, Relations, Row, SqlValue};
use std::collections::BTreeMap;

/// A column value together with the timestamp of the write that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedValue {
    /// The column value.
    pub value: SqlValue,
    /// UTC milliseconds of the contributing write.
    pub timestamp: i64,
}

/// The resolved outcome for one primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRow {
    /// `Upsert`, `Delete`, or `Gone`.
    pub optype: OpType,
    /// Columns that were explicitly written, with winning timestamps.
    pub changes: BTreeMap<String, TimestampedValue>,
    /// The complete row to write for an upsert.
    pub full_row: Row,
    /// The row's merged causal tag set.
    pub tags: TagSet,
}

/// Merge output: resolved rows grouped by table and primary-key JSON.
pub type MergedChanges = BTreeMap<QualifiedTablename, BTreeMap<String, ResolvedRow>>;

/// One side's folded view of all operations on a single primary key.
#[derive(Debug, Clone, Default)]
struct FoldedChanges {
    optype: Option<OpType>,
    changes: BTreeMap<String, TimestampedValue>,
    full_row: Row,
    tags: TagSet,
    clear_tags: TagSet,
}

impl FoldedChanges {
    fn overlay_row(&mut self, row: &Row, missing_only: bool) {
        for (col, value) in row {
            if !missing_only || !self.full_row.contains_key(col) {
                self.full_row.insert(col.clone(), value.clone());
            }
        }
    }

    /// Records the columns `new` actually changed relative to `old`.
    ///
    /// With no old row (inserts) every column counts, including explicit
    /// nulls.
    fn record_changes(&mut self, new: &Row, old: Option<&Row>, timestamp: i64) {
        for (col, value) in new {
            let changed = match old {
                Some(old_row) => old_row.get(col) != Some(value),
                None => true,
            };
            if changed {
                self.changes.insert(
                    col.clone(),
                    TimestampedValue {
                        value: value.clone(),
                        timestamp,
                    },
                );
            }
        }
    }
}

fn entry_timestamp(entry: &OplogEntry) -> SatelliteResult<i64> {
    entry.timestamp.ok_or_else(|| {
        SatelliteError::internal(format!(
            "unsnapshotted oplog entry reached merge: rowid {}",
            entry.rowid
        ))
    })
}

/// Folds local (snapshotted) oplog entries for one primary key, in rowid
/// order.
fn fold_local(client_id: &str, entries: &[&OplogEntry]) -> SatelliteResult<FoldedChanges> {
    let mut folded = FoldedChanges::default();

    for &entry in entries {
        let timestamp = entry_timestamp(entry)?;
        let clear = entry.decoded_clear_tags()?;

        match entry.optype {
            OpType::Insert | OpType::Update | OpType::Upsert | OpType::Compensation => {
                folded.tags = folded.tags.difference(&clear);
                folded.tags.insert(Tag::generate(client_id, timestamp));
                folded.clear_tags.extend(&clear);

                if let Some(new_row) = &entry.new_row {
                    folded.record_changes(new_row, entry.old_row.as_ref(), timestamp);
                    folded.overlay_row(new_row, false);
                }
                folded.optype = Some(OpType::Upsert);
            }
            OpType::Delete => {
                folded.tags = folded.tags.difference(&clear);
                folded.clear_tags.extend(&clear);
                if let Some(old_row) = &entry.old_row {
                    folded.overlay_row(old_row, true);
                }
                folded.optype = Some(OpType::Delete);
            }
            OpType::Gone => {
                // GONE is a server-side optype; it never originates locally.
                return Err(SatelliteError::internal("local oplog contains GONE entry"));
            }
        }
    }
    Ok(folded)
}

/// Folds incoming changes for one primary key, in transaction order.
///
/// For incoming entries the `clear_tags` field carries the wire tag set,
/// interpreted per optype: for inserts and updates it is the row's new tags,
/// for deletes the observed tags being cleared.
fn fold_incoming(origin: &str, entries: &[&OplogEntry]) -> SatelliteResult<FoldedChanges> {
    let mut folded = FoldedChanges::default();

    for &entry in entries {
        let timestamp = entry_timestamp(entry)?;
        let wire_tags = entry.decoded_clear_tags()?;

        match entry.optype {
            OpType::Insert | OpType::Update | OpType::Upsert | OpType::Compensation => {
                folded.tags = if wire_tags.is_empty() {
                    TagSet::singleton(Tag::generate(origin, timestamp))
                } else {
                    wire_tags
                };

                if let Some(record) = &entry.new_row {
                    folded.record_changes(record, entry.old_row.as_ref(), timestamp);
                    folded.overlay_row(record, false);
                }
                folded.optype = Some(OpType::Upsert);
            }
            OpType::Delete => {
                folded.tags = folded.tags.difference(&wire_tags);
                folded.clear_tags.extend(&wire_tags);
                if let Some(old_record) = &entry.old_row {
                    folded.overlay_row(old_record, true);
                }
                folded.optype = Some(OpType::Delete);
            }
            OpType::Gone => {
                folded.tags = TagSet::new();
                if let Some(record) = entry.new_row.as_ref().or(entry.old_row.as_ref()) {
                    folded.overlay_row(record, true);
                }
                folded.optype = Some(OpType::Gone);
            }
        }
    }
    Ok(folded)
}

/// Resolves one primary key from its two folded sides.
fn resolve(local: Option<FoldedChanges>, incoming: Option<FoldedChanges>) -> ResolvedRow {
    match (local, incoming) {
        (Some(local), Some(incoming)) => {
            // Column-level last-writer-wins; incoming wins ties.
            let mut changes = local.changes;
            for (col, theirs) in incoming.changes {
                match changes.get(&col) {
                    Some(ours) if ours.timestamp > theirs.timestamp => {}
                    _ => {
                        changes.insert(col, theirs);
                    }
                }
            }

            let mut full_row = local.full_row;
            for (col, value) in incoming.full_row {
                full_row.entry(col).or_insert(value);
            }
            for (col, tv) in &changes {
                full_row.insert(col.clone(), tv.value.clone());
            }

            let tags = local
                .tags
                .difference(&incoming.clear_tags)
                .union(&incoming.tags.difference(&local.clear_tags));

            let optype = if incoming.optype == Some(OpType::Gone) {
                OpType::Gone
            } else if tags.is_empty() {
                OpType::Delete
            } else {
                OpType::Upsert
            };

            ResolvedRow {
                optype,
                changes,
                full_row,
                tags,
            }
        }
        (Some(side), None) | (None, Some(side)) => {
            let optype = match side.optype {
                Some(OpType::Gone) => OpType::Gone,
                _ if side.tags.is_empty() => OpType::Delete,
                _ => OpType::Upsert,
            };
            ResolvedRow {
                optype,
                changes: side.changes,
                full_row: side.full_row,
                tags: side.tags,
            }
        }
        (None, None) => ResolvedRow {
            optype: OpType::Delete,
            changes: BTreeMap::new(),
            full_row: Row::new(),
            tags: TagSet::new(),
        },
    }
}

/// Merges local and incoming oplog entries into resolved rows per primary
/// key.
///
/// `local` holds this client's snapshotted, not-yet-acknowledged entries;
/// `incoming` holds the changes of one remote transaction converted to oplog
/// form. Every referenced table must be present in `relations`.
pub fn merge_entries(
    client_id: &str,
    local: &[OplogEntry],
    incoming_origin: &str,
    incoming: &[OplogEntry],
    relations: &Relations,
) -> SatelliteResult<MergedChanges> {
    for entry in local.iter().chain(incoming.iter()) {
        let table = entry.qualified_table();
        if !relations.contains_key(&table) {
            return Err(SatelliteError::table_not_found(table.to_string()));
        }
    }

    let local_grouped = crate::oplog::group_by_primary_key(local);
    let incoming_grouped = crate::oplog::group_by_primary_key(incoming);

    let mut tables: Vec<&QualifiedTablename> = local_grouped.keys().collect();
    for table in incoming_grouped.keys() {
        if !local_grouped.contains_key(table) {
            tables.push(table);
        }
    }

    let mut merged = MergedChanges::new();
    for table in tables {
        let empty = BTreeMap::new();
        let local_pks = local_grouped.get(table).unwrap_or(&empty);
        let incoming_pks = incoming_grouped.get(table).unwrap_or(&empty);

        let mut pks: Vec<&String> = local_pks.keys().collect();
        for pk in incoming_pks.keys() {
            if !local_pks.contains_key(pk) {
                pks.push(pk);
            }
        }

        let mut resolved_rows = BTreeMap::new();
        for pk in pks {
            let local_fold = match local_pks.get(pk) {
                Some(entries) => Some(fold_local(client_id, entries)?),
                None => None,
            };
            let incoming_fold = match incoming_pks.get(pk) {
                Some(entries) => Some(fold_incoming(incoming_origin, entries)?),
                None => None,
            };
            resolved_rows.insert(pk.clone(), resolve(local_fold, incoming_fold));
        }
        merged.insert(table.clone(), resolved_rows);
    }
    Ok(merged)
}
