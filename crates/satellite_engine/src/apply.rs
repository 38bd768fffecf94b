//! Apply engine.
//!
//! Applies remote transactions atomically: incoming changes are merged
//! against the not-yet-acknowledged local oplog, the resolved rows are
//! written with capture suppressed, shadow rows are updated, the LSN is
//! advanced, and (for transactions of our own origin) the acknowledged
//! oplog entries are garbage-collected. Nothing an apply does may add to
//! the local oplog; anything defensive triggers produce is deleted before
//! commit.

use crate::adapter::{DbAdapter, Dialect, Statement};
use crate::config::FkChecks;
use crate::notifier::{DataChangeNotification, Notifier, TableChange};
use crate::store::OplogStore;
use satellite_core::{
    merge_entries, OpType, OplogEntry, QualifiedTablename, Relation, Relations, ResolvedRow, Row,
    SatelliteError, SatelliteResult, ShadowEntry, SqlValue, Tag, TagSet,
};
use satellite_proto::{ChangeType, DataChange, DataTransaction, GoneBatch};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Applies remote transactions and shape data to the local database.
pub struct ApplyEngine<A: DbAdapter> {
    store: Arc<OplogStore<A>>,
    notifier: Arc<Notifier>,
    client_id: String,
    relations: Relations,
    fk_checks: FkChecks,
    compensations: bool,
}

impl<A: DbAdapter> ApplyEngine<A> {
    /// Creates an apply engine.
    pub fn new(
        store: Arc<OplogStore<A>>,
        notifier: Arc<Notifier>,
        client_id: impl Into<String>,
        relations: Relations,
        fk_checks: FkChecks,
        compensations: bool,
    ) -> Self {
        Self {
            store,
            notifier,
            client_id: client_id.into(),
            relations,
            fk_checks,
            compensations,
        }
    }

    /// Returns the session's relations.
    pub fn relations(&self) -> &Relations {
        &self.relations
    }

    /// Applies one incoming transaction.
    ///
    /// The whole apply is a single database transaction: on any error the
    /// local database is unchanged and the LSN does not advance.
    pub fn apply_transaction(&self, tx: &DataTransaction) -> SatelliteResult<()> {
        let incoming = self.convert_changes(&tx.changes, tx.commit_timestamp)?;

        let applied = self.store.adapter().transaction(|_| {
            let watermark = self.store.max_rowid()?.unwrap_or(0);

            let merged = self.merge_against_local(&tx.origin, &incoming)?;
            self.write_resolved(&merged)?;

            self.store.set_lsn(&tx.lsn)?;
            if tx.origin == self.client_id {
                let collected = self.store.garbage_collect(tx.commit_timestamp)?;
                debug!(collected, "acknowledged own transaction");
            }

            // Capture is suppressed during apply; if triggers fired anyway,
            // drop whatever they produced.
            self.store.delete_entries_after(watermark)?;
            Ok(summarize(&merged))
        })?;

        if !applied.is_empty() {
            self.notifier.emit_data_changes(DataChangeNotification {
                origin: tx.origin.clone(),
                changes: applied,
            });
        }
        Ok(())
    }

    /// Applies an out-of-band additional-data batch.
    ///
    /// Additional data belongs to an already-applied transaction, so the
    /// LSN does not move and no oplog is collected.
    pub fn apply_additional_data(
        &self,
        origin: &str,
        commit_timestamp: i64,
        changes: &[DataChange],
    ) -> SatelliteResult<()> {
        let incoming = self.convert_changes(changes, commit_timestamp)?;

        let applied = self.store.adapter().transaction(|_| {
            let watermark = self.store.max_rowid()?.unwrap_or(0);
            let merged = self.merge_against_local(origin, &incoming)?;
            self.write_resolved(&merged)?;
            self.store.set_meta(crate::store::META_SEEN_ADDITIONAL_DATA, "1")?;
            self.store.delete_entries_after(watermark)?;
            Ok(summarize(&merged))
        })?;

        if !applied.is_empty() {
            self.notifier.emit_data_changes(DataChangeNotification {
                origin: origin.to_string(),
                changes: applied,
            });
        }
        Ok(())
    }

    /// Removes the rows of a gone batch: they left every subscribed shape,
    /// so they disappear locally without tombstones.
    pub fn apply_gone_batch(&self, batch: &GoneBatch, commit_timestamp: i64) -> SatelliteResult<()> {
        let changes: Vec<DataChange> = batch
            .rows
            .iter()
            .map(|gone| DataChange::gone(gone.tablename.clone(), gone.record.clone()))
            .collect();

        let incoming = self.convert_changes(&changes, commit_timestamp)?;
        let applied = self.store.adapter().transaction(|_| {
            let watermark = self.store.max_rowid()?.unwrap_or(0);
            let merged = self.merge_against_local("", &incoming)?;
            self.write_resolved(&merged)?;
            self.store.delete_entries_after(watermark)?;
            Ok(summarize(&merged))
        })?;

        if !applied.is_empty() {
            self.notifier.emit_data_changes(DataChangeNotification {
                origin: batch.server_id.clone(),
                changes: applied,
            });
        }
        Ok(())
    }

    /// Applies the initial data batch of an establishing shape
    /// subscription.
    ///
    /// Runs inside the caller's transaction so a failing delivery rolls
    /// back every row of the attempt. Returns the delivered primary keys
    /// per table.
    pub fn apply_shape_data(
        &self,
        origin: &str,
        commit_timestamp: i64,
        changes: &[DataChange],
    ) -> SatelliteResult<BTreeMap<QualifiedTablename, BTreeSet<String>>> {
        let incoming = self.convert_changes(changes, commit_timestamp)?;
        let merged = self.merge_against_local(origin, &incoming)?;
        self.write_resolved(&merged)?;

        let mut delivered: BTreeMap<QualifiedTablename, BTreeSet<String>> = BTreeMap::new();
        for (table, rows) in &merged {
            delivered
                .entry(table.clone())
                .or_default()
                .extend(rows.keys().cloned());
        }
        Ok(delivered)
    }

    /// Converts wire changes into incoming oplog entries for the merge.
    fn convert_changes(
        &self,
        changes: &[DataChange],
        commit_timestamp: i64,
    ) -> SatelliteResult<Vec<OplogEntry>> {
        changes
            .iter()
            .map(|change| {
                let relation = self.relations.get(&change.relation).ok_or_else(|| {
                    SatelliteError::table_not_found(change.relation.to_string())
                })?;

                let optype = match change.change_type {
                    ChangeType::Insert => OpType::Insert,
                    ChangeType::Update => OpType::Update,
                    ChangeType::Delete => OpType::Delete,
                    ChangeType::Gone => OpType::Gone,
                    // Initial shape data behaves as a merged insert-or-update.
                    ChangeType::Initial => OpType::Upsert,
                };

                let key_row = change
                    .record
                    .as_ref()
                    .or(change.old_record.as_ref())
                    .ok_or_else(|| {
                        SatelliteError::internal("incoming change carries no record")
                    })?;

                Ok(OplogEntry {
                    rowid: 0,
                    namespace: change.relation.namespace.clone(),
                    tablename: change.relation.tablename.clone(),
                    optype,
                    primary_key: relation.primary_key_json(key_row),
                    new_row: change.record.clone(),
                    old_row: change.old_record.clone(),
                    timestamp: Some(commit_timestamp),
                    clear_tags: TagSet::from_wire(&change.tags)?.encode(),
                })
            })
            .collect()
    }

    /// Merges incoming entries against the local oplog entries touching the
    /// same primary keys.
    fn merge_against_local(
        &self,
        origin: &str,
        incoming: &[OplogEntry],
    ) -> SatelliteResult<satellite_core::MergedChanges> {
        let incoming_keys: BTreeSet<(QualifiedTablename, &str)> = incoming
            .iter()
            .map(|e| (e.qualified_table(), e.primary_key.as_str()))
            .collect();

        let local: Vec<OplogEntry> = self
            .store
            .entries_since(None)?
            .into_iter()
            .filter(|e| incoming_keys.contains(&(e.qualified_table(), e.primary_key.as_str())))
            .collect();

        merge_entries(&self.client_id, &local, origin, incoming, &self.relations)
    }

    /// Writes resolved rows: upserts parents-first, deletes children-first,
    /// shadow rows alongside.
    fn write_resolved(&self, merged: &satellite_core::MergedChanges) -> SatelliteResult<()> {
        if self.fk_checks == FkChecks::Disabled {
            let stmt = match self.store.builder().dialect() {
                Dialect::Sqlite => "PRAGMA defer_foreign_keys = ON",
                Dialect::Postgres => "SET CONSTRAINTS ALL DEFERRED",
            };
            self.store.adapter().run(&Statement::simple(stmt))?;
        }

        let tables: Vec<&QualifiedTablename> = merged.keys().collect();
        let children_first = satellite_core::types::reverse_fk_order(&self.relations, &tables);
        let parents_first: Vec<&QualifiedTablename> =
            children_first.iter().rev().copied().collect();

        for &table in &parents_first {
            let relation = self.relation(table)?;
            for (pk, resolved) in &merged[table] {
                if resolved.optype == OpType::Upsert {
                    self.upsert_row(relation, resolved)?;
                    self.store.upsert_shadow(&ShadowEntry::new(
                        table.namespace.clone(),
                        table.tablename.clone(),
                        pk.clone(),
                        resolved.tags.clone(),
                    ))?;
                }
            }
        }

        for &table in &children_first {
            let relation = self.relation(table)?;
            for (pk, resolved) in &merged[table] {
                match resolved.optype {
                    OpType::Delete => self.delete_row(table, relation, pk, resolved, true)?,
                    OpType::Gone => self.delete_row(table, relation, pk, resolved, false)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn relation(&self, table: &QualifiedTablename) -> SatelliteResult<&Relation> {
        self.relations
            .get(table)
            .ok_or_else(|| SatelliteError::table_not_found(table.to_string()))
    }

    fn upsert_row(&self, relation: &Relation, resolved: &ResolvedRow) -> SatelliteResult<()> {
        let builder = self.store.builder();
        let table_sql = builder.make_qt(&relation.table);

        // Only columns the relation knows about reach the database.
        let columns: Vec<&str> = relation
            .column_names()
            .into_iter()
            .filter(|c| resolved.full_row.contains_key(*c))
            .collect();
        if columns.is_empty() {
            return Err(SatelliteError::internal("resolved row has no columns"));
        }

        let column_list = columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| builder.make_positional_param(i))
            .collect::<Vec<_>>()
            .join(", ");

        // ON CONFLICT DO UPDATE rather than INSERT OR REPLACE: REPLACE is a
        // delete-then-insert and trips FK enforcement when a child still
        // references the row.
        let pk_columns = relation.pk_columns();
        let pk_list = pk_columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns
            .iter()
            .filter(|c| !pk_columns.contains(c))
            .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let conflict_action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {updates}")
        };
        let sql = format!(
            "INSERT INTO {table_sql} ({column_list}) VALUES ({placeholders}) \
             ON CONFLICT ({pk_list}) {conflict_action}"
        );

        let args = columns
            .iter()
            .map(|c| resolved.full_row[*c].clone())
            .collect();
        self.store.adapter().run(&Statement::new(sql, args))?;
        Ok(())
    }

    fn delete_row(
        &self,
        table: &QualifiedTablename,
        relation: &Relation,
        pk: &str,
        resolved: &ResolvedRow,
        check_compensations: bool,
    ) -> SatelliteResult<()> {
        if check_compensations && self.fk_checks == FkChecks::Inherit {
            if let Some(child) = self.referencing_child(relation, resolved)? {
                if self.compensations {
                    // Refuse the delete: resurrect a minimal parent row so
                    // the child keeps a valid reference.
                    debug!(table = %table, child = %child, "compensating incoming delete");
                    self.compensate_delete(table, relation, pk, resolved)?;
                    return Ok(());
                }
                return Err(SatelliteError::fk_violation(format!(
                    "incoming delete of {table} row {pk} still referenced by {child}"
                )));
            }
        }

        let builder = self.store.builder();
        let pk_columns = relation.pk_columns();
        let predicate = pk_columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("\"{c}\" = {}", builder.make_positional_param(i + 1)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let args: Vec<SqlValue> = pk_columns
            .iter()
            .map(|c| {
                resolved
                    .full_row
                    .get(*c)
                    .cloned()
                    .ok_or_else(|| SatelliteError::internal("resolved delete lost its key"))
            })
            .collect::<SatelliteResult<_>>()?;

        self.store.adapter().run(&Statement::new(
            format!("DELETE FROM {} WHERE {predicate}", builder.make_qt(table)),
            args,
        ))?;
        self.store.delete_shadow(table, pk)?;
        Ok(())
    }

    /// Finds a child table that still references the row being deleted.
    fn referencing_child(
        &self,
        parent: &Relation,
        resolved: &ResolvedRow,
    ) -> SatelliteResult<Option<QualifiedTablename>> {
        let builder = self.store.builder();

        for relation in self.relations.values() {
            for fk in &relation.foreign_keys {
                if fk.parent_table != parent.table {
                    continue;
                }
                let predicate = fk
                    .child_columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("\"{c}\" = {}", builder.make_positional_param(i + 1)))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                let args: Vec<SqlValue> = fk
                    .parent_columns
                    .iter()
                    .map(|c| {
                        resolved.full_row.get(c).cloned().ok_or_else(|| {
                            SatelliteError::internal("resolved delete lost referenced columns")
                        })
                    })
                    .collect::<SatelliteResult<_>>()?;

                let rows = self.store.adapter().query(&Statement::new(
                    format!(
                        "SELECT 1 AS hit FROM {} WHERE {predicate} LIMIT 1",
                        builder.make_qt(&relation.table)
                    ),
                    args,
                ))?;
                if !rows.is_empty() {
                    return Ok(Some(relation.table.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Writes the minimal parent row that keeps the child's reference
    /// valid: key columns from the resolved row, everything else null.
    fn compensate_delete(
        &self,
        table: &QualifiedTablename,
        relation: &Relation,
        pk: &str,
        resolved: &ResolvedRow,
    ) -> SatelliteResult<()> {
        let mut minimal = Row::new();
        for column in relation.column_names() {
            let value = if relation.pk_columns().contains(&column) {
                resolved
                    .full_row
                    .get(column)
                    .cloned()
                    .ok_or_else(|| SatelliteError::internal("compensation lost its key"))?
            } else {
                SqlValue::Null
            };
            minimal.insert(column.to_string(), value);
        }

        let compensated = ResolvedRow {
            optype: OpType::Upsert,
            changes: BTreeMap::new(),
            full_row: minimal,
            tags: TagSet::singleton(Tag::generate(
                &self.client_id,
                crate::snapshot::now_millis(),
            )),
        };
        self.upsert_row(relation, &compensated)?;
        self.store.upsert_shadow(&ShadowEntry::new(
            table.namespace.clone(),
            table.tablename.clone(),
            pk,
            compensated.tags,
        ))?;
        Ok(())
    }
}

fn summarize(merged: &satellite_core::MergedChanges) -> Vec<TableChange> {
    merged
        .iter()
        .map(|(table, rows)| TableChange {
            table: table.clone(),
            rowids: Vec::new(),
            record_changes: rows.len(),
        })
        .collect()
}
