//! Oplog store.
//!
//! Persists oplog entries, shadow rows, and engine metadata in the same
//! transactional store as the user's data, under `_electric_oplog`,
//! `_electric_shadow`, and `_electric_meta`. Capture triggers installed by
//! the migration layer append raw oplog rows on every user-table mutation;
//! the snapshot engine stamps them, and the apply engine garbage-collects
//! acknowledged ones.
//!
//! Store operations issue plain statements on the shared connection, so they
//! participate in whatever transaction the caller has open on the adapter.

use crate::adapter::{DbAdapter, QueryBuilder, Statement};
use base64::Engine;
use satellite_core::{
    OpType, OplogEntry, QualifiedTablename, Row, SatelliteError, SatelliteResult, ShadowEntry,
    SqlValue, TagSet,
};
use std::sync::Arc;

/// Meta key holding the stable client id.
pub const META_CLIENT_ID: &str = "clientId";
/// Meta key holding the base64 last-acknowledged server LSN.
pub const META_LSN: &str = "lsn";
/// Meta key holding the compensations flag (`0`/`1`).
pub const META_COMPENSATIONS: &str = "compensations";
/// Meta key holding the serialized subscription-manager state.
pub const META_SUBSCRIPTIONS: &str = "subscriptions";
/// Meta key recording that out-of-band additional data has been seen.
pub const META_SEEN_ADDITIONAL_DATA: &str = "seenAdditionalData";

const OPLOG_COLUMNS: &str =
    "rowid, namespace, tablename, optype, primary_key, new_row, old_row, timestamp, clear_tags";

/// Persistence for oplog entries, shadow rows, and metadata.
pub struct OplogStore<A: DbAdapter> {
    adapter: Arc<A>,
    builder: QueryBuilder,
}

impl<A: DbAdapter> OplogStore<A> {
    /// Creates a store over the given adapter.
    pub fn new(adapter: Arc<A>, builder: QueryBuilder) -> Self {
        Self { adapter, builder }
    }

    /// Returns the underlying adapter.
    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    /// Returns the query builder.
    pub fn builder(&self) -> QueryBuilder {
        self.builder
    }

    /// Creates the engine's tables if they do not exist.
    ///
    /// The trigger-installing migration runner is a separate collaborator;
    /// only the oplog, shadow, and meta tables are bootstrapped here.
    pub fn ensure_tables(&self) -> SatelliteResult<()> {
        let autoincrement = match self.builder.dialect() {
            crate::adapter::Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            crate::adapter::Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
        };

        self.adapter.run(&Statement::simple(format!(
            "CREATE TABLE IF NOT EXISTS _electric_oplog (\
                 rowid {autoincrement}, \
                 namespace TEXT NOT NULL, \
                 tablename TEXT NOT NULL, \
                 optype TEXT NOT NULL, \
                 primary_key TEXT NOT NULL, \
                 new_row TEXT, \
                 old_row TEXT, \
                 timestamp INTEGER, \
                 clear_tags TEXT NOT NULL DEFAULT '[]')"
        )))?;
        self.adapter.run(&Statement::simple(
            "CREATE TABLE IF NOT EXISTS _electric_shadow (\
                 namespace TEXT NOT NULL, \
                 tablename TEXT NOT NULL, \
                 primary_key TEXT NOT NULL, \
                 tags TEXT NOT NULL, \
                 PRIMARY KEY (namespace, tablename, primary_key))",
        ))?;
        self.adapter.run(&Statement::simple(
            "CREATE TABLE IF NOT EXISTS _electric_meta (\
                 key TEXT PRIMARY KEY, \
                 value TEXT)",
        ))?;
        Ok(())
    }

    // ---- oplog ----

    /// Appends a raw oplog entry the way a capture trigger would.
    ///
    /// The entry is unstamped: its timestamp stays null until the next
    /// snapshot.
    pub fn insert_raw_entry(&self, entry: &OplogEntry) -> SatelliteResult<()> {
        self.adapter.run(&Statement::new(
            "INSERT INTO _electric_oplog \
             (namespace, tablename, optype, primary_key, new_row, old_row, timestamp, clear_tags) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            vec![
                SqlValue::from(entry.namespace.clone()),
                SqlValue::from(entry.tablename.clone()),
                SqlValue::from(entry.optype.as_str()),
                SqlValue::from(entry.primary_key.clone()),
                opt_row_to_sql(&entry.new_row)?,
                opt_row_to_sql(&entry.old_row)?,
                entry
                    .timestamp
                    .map(SqlValue::Integer)
                    .unwrap_or(SqlValue::Null),
                SqlValue::from(entry.clear_tags.clone()),
            ],
        ))?;
        Ok(())
    }

    /// Returns entries not yet processed by a snapshot, in rowid order.
    pub fn unprocessed_entries(&self) -> SatelliteResult<Vec<OplogEntry>> {
        let rows = self.adapter.query(&Statement::simple(format!(
            "SELECT {OPLOG_COLUMNS} FROM _electric_oplog \
             WHERE timestamp IS NULL ORDER BY rowid ASC"
        )))?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Returns snapshotted entries with rowid greater than `since`, in
    /// rowid order.
    pub fn entries_since(&self, since: Option<i64>) -> SatelliteResult<Vec<OplogEntry>> {
        let rows = self.adapter.query(&Statement::new(
            format!(
                "SELECT {OPLOG_COLUMNS} FROM _electric_oplog \
                 WHERE timestamp IS NOT NULL AND rowid > ? ORDER BY rowid ASC"
            ),
            vec![SqlValue::Integer(since.unwrap_or(-1))],
        ))?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Writes back a stamped entry after snapshot processing.
    pub fn stamp_entry(&self, entry: &OplogEntry) -> SatelliteResult<()> {
        let timestamp = entry.timestamp.ok_or_else(|| {
            SatelliteError::internal("stamp_entry requires a snapshot timestamp")
        })?;
        self.adapter.run(&Statement::new(
            "UPDATE _electric_oplog \
             SET timestamp = ?, clear_tags = ?, new_row = ?, optype = ? \
             WHERE rowid = ?",
            vec![
                SqlValue::Integer(timestamp),
                SqlValue::from(entry.clear_tags.clone()),
                opt_row_to_sql(&entry.new_row)?,
                SqlValue::from(entry.optype.as_str()),
                SqlValue::Integer(entry.rowid),
            ],
        ))?;
        Ok(())
    }

    /// Returns the highest oplog rowid, or `None` when the log is empty.
    pub fn max_rowid(&self) -> SatelliteResult<Option<i64>> {
        let rows = self
            .adapter
            .query(&Statement::simple("SELECT MAX(rowid) AS m FROM _electric_oplog"))?;
        Ok(rows.first().and_then(|r| match r.get("m") {
            Some(SqlValue::Integer(i)) => Some(*i),
            _ => None,
        }))
    }

    /// Deletes acknowledged entries with a snapshot timestamp at or before
    /// `upto_timestamp`.
    pub fn garbage_collect(&self, upto_timestamp: i64) -> SatelliteResult<usize> {
        self.adapter.run(&Statement::new(
            "DELETE FROM _electric_oplog \
             WHERE timestamp IS NOT NULL AND timestamp <= ?",
            vec![SqlValue::Integer(upto_timestamp)],
        ))
    }

    /// Deletes entries with rowid greater than `watermark`.
    ///
    /// Used after apply to drop anything defensive triggers produced while
    /// capture was suppressed.
    pub fn delete_entries_after(&self, watermark: i64) -> SatelliteResult<usize> {
        self.adapter.run(&Statement::new(
            "DELETE FROM _electric_oplog WHERE rowid > ?",
            vec![SqlValue::Integer(watermark)],
        ))
    }

    /// Deletes every oplog entry. Used by the BEHIND_WINDOW reset.
    pub fn clear_oplog(&self) -> SatelliteResult<usize> {
        self.adapter
            .run(&Statement::simple("DELETE FROM _electric_oplog"))
    }

    // ---- shadow ----

    /// Loads the shadow entry for a (table, primary key), if the row
    /// currently exists.
    pub fn get_shadow(
        &self,
        table: &QualifiedTablename,
        primary_key: &str,
    ) -> SatelliteResult<Option<ShadowEntry>> {
        let rows = self.adapter.query(&Statement::new(
            "SELECT namespace, tablename, primary_key, tags FROM _electric_shadow \
             WHERE namespace = ? AND tablename = ? AND primary_key = ?",
            vec![
                SqlValue::from(table.namespace.clone()),
                SqlValue::from(table.tablename.clone()),
                SqlValue::from(primary_key),
            ],
        ))?;

        rows.first()
            .map(|row| {
                Ok(ShadowEntry::new(
                    text_column(row, "namespace")?,
                    text_column(row, "tablename")?,
                    text_column(row, "primary_key")?,
                    TagSet::decode(&text_column(row, "tags")?)?,
                ))
            })
            .transpose()
    }

    /// Inserts or replaces a shadow entry.
    pub fn upsert_shadow(&self, entry: &ShadowEntry) -> SatelliteResult<()> {
        self.adapter.run(&Statement::new(
            "INSERT INTO _electric_shadow (namespace, tablename, primary_key, tags) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (namespace, tablename, primary_key) DO UPDATE SET tags = excluded.tags",
            vec![
                SqlValue::from(entry.namespace.clone()),
                SqlValue::from(entry.tablename.clone()),
                SqlValue::from(entry.primary_key.clone()),
                SqlValue::from(entry.tags.encode()),
            ],
        ))?;
        Ok(())
    }

    /// Deletes the shadow entry for a (table, primary key).
    pub fn delete_shadow(
        &self,
        table: &QualifiedTablename,
        primary_key: &str,
    ) -> SatelliteResult<()> {
        self.adapter.run(&Statement::new(
            "DELETE FROM _electric_shadow \
             WHERE namespace = ? AND tablename = ? AND primary_key = ?",
            vec![
                SqlValue::from(table.namespace.clone()),
                SqlValue::from(table.tablename.clone()),
                SqlValue::from(primary_key),
            ],
        ))?;
        Ok(())
    }

    /// Deletes every shadow entry. Used by the BEHIND_WINDOW reset.
    pub fn clear_shadow(&self) -> SatelliteResult<usize> {
        self.adapter
            .run(&Statement::simple("DELETE FROM _electric_shadow"))
    }

    // ---- meta ----

    /// Reads a meta value.
    pub fn get_meta(&self, key: &str) -> SatelliteResult<Option<String>> {
        let rows = self.adapter.query(&Statement::new(
            "SELECT value FROM _electric_meta WHERE key = ?",
            vec![SqlValue::from(key)],
        ))?;
        Ok(rows.first().and_then(|r| match r.get("value") {
            Some(SqlValue::Text(s)) => Some(s.clone()),
            _ => None,
        }))
    }

    /// Writes a meta value.
    pub fn set_meta(&self, key: &str, value: &str) -> SatelliteResult<()> {
        self.adapter.run(&Statement::new(
            "INSERT INTO _electric_meta (key, value) VALUES (?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            vec![SqlValue::from(key), SqlValue::from(value)],
        ))?;
        Ok(())
    }

    /// Removes a meta value.
    pub fn delete_meta(&self, key: &str) -> SatelliteResult<()> {
        self.adapter.run(&Statement::new(
            "DELETE FROM _electric_meta WHERE key = ?",
            vec![SqlValue::from(key)],
        ))?;
        Ok(())
    }

    /// Returns the persisted client id.
    pub fn client_id(&self) -> SatelliteResult<Option<String>> {
        self.get_meta(META_CLIENT_ID)
    }

    /// Persists the client id.
    pub fn set_client_id(&self, client_id: &str) -> SatelliteResult<()> {
        self.set_meta(META_CLIENT_ID, client_id)
    }

    /// Returns the last acknowledged server LSN.
    pub fn lsn(&self) -> SatelliteResult<Option<Vec<u8>>> {
        match self.get_meta(META_LSN)? {
            None => Ok(None),
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(&encoded)
                .map(Some)
                .map_err(|e| SatelliteError::internal(format!("corrupt lsn meta: {e}"))),
        }
    }

    /// Persists the last acknowledged server LSN.
    ///
    /// Only call after every change at or before this LSN is durably
    /// committed locally.
    pub fn set_lsn(&self, lsn: &[u8]) -> SatelliteResult<()> {
        self.set_meta(
            META_LSN,
            &base64::engine::general_purpose::STANDARD.encode(lsn),
        )
    }

    /// Clears the persisted LSN. Used by the BEHIND_WINDOW reset.
    pub fn reset_lsn(&self) -> SatelliteResult<()> {
        self.delete_meta(META_LSN)
    }

    /// Returns the compensations flag.
    pub fn compensations(&self) -> SatelliteResult<bool> {
        Ok(self.get_meta(META_COMPENSATIONS)?.as_deref() == Some("1"))
    }

    /// Persists the compensations flag.
    pub fn set_compensations(&self, enabled: bool) -> SatelliteResult<()> {
        self.set_meta(META_COMPENSATIONS, if enabled { "1" } else { "0" })
    }
}

fn opt_row_to_sql(row: &Option<Row>) -> SatelliteResult<SqlValue> {
    match row {
        None => Ok(SqlValue::Null),
        Some(row) => serde_json::to_string(row)
            .map(SqlValue::Text)
            .map_err(|e| SatelliteError::internal(format!("row serialization: {e}"))),
    }
}

fn text_column(row: &Row, name: &str) -> SatelliteResult<String> {
    match row.get(name) {
        Some(SqlValue::Text(s)) => Ok(s.clone()),
        other => Err(SatelliteError::internal(format!(
            "expected text column {name}, got {other:?}"
        ))),
    }
}

fn entry_from_row(row: &Row) -> SatelliteResult<OplogEntry> {
    let rowid = match row.get("rowid") {
        Some(SqlValue::Integer(i)) => *i,
        other => {
            return Err(SatelliteError::internal(format!(
                "expected integer rowid, got {other:?}"
            )))
        }
    };
    let optype_str = text_column(row, "optype")?;
    let optype = OpType::parse(&optype_str)
        .ok_or_else(|| SatelliteError::internal(format!("unknown optype {optype_str:?}")))?;

    let parse_row = |name: &str| -> SatelliteResult<Option<Row>> {
        match row.get(name) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(SqlValue::Text(json)) => serde_json::from_str(json)
                .map(Some)
                .map_err(|e| SatelliteError::internal(format!("corrupt {name} column: {e}"))),
            other => Err(SatelliteError::internal(format!(
                "expected json column {name}, got {other:?}"
            ))),
        }
    };

    Ok(OplogEntry {
        rowid,
        namespace: text_column(row, "namespace")?,
        tablename: text_column(row, "tablename")?,
        optype,
        primary_key: text_column(row, "primary_key")?,
        new_row: parse_row("new_row")?,
        old_row: parse_row("old_row")?,
        timestamp: match row.get("timestamp") {
            Some(SqlValue::Integer(i)) => Some(*i),
            _ => None,
        },
        clear_tags: text_column(row, "clear_tags")?,
    })
}
