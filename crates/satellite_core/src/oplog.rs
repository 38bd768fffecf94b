//! Oplog and shadow-row data model.
//!
//! The oplog is the append-only local change log captured by triggers on
//! user-table mutation. Each live row additionally has exactly one shadow
//! entry holding its observed causal tag set; absence of a shadow row is the
//! tombstone.
//!
//! # Invariants
//!
//! - Oplog rowids are monotonically increasing and gap-free per session
//! - A sender never observes an entry after its transaction is acknowledged
//! - Every live user row has exactly one shadow entry and vice versa

use crate::error::SatelliteResult;
use crate::tags::TagSet;
use crate::types::{QualifiedTablename, Row};
use std::collections::BTreeMap;

/// The kind of operation an oplog entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Row created.
    Insert,
    /// Row modified.
    Update,
    /// Row removed by the user.
    Delete,
    /// Merged insert-or-update (merge output and initial shape data).
    Upsert,
    /// Row moved out of every subscribed shape; removed without tombstone.
    Gone,
    /// Synthetic parent insert repairing an incoming FK-violating delete.
    Compensation,
}

impl OpType {
    /// Converts to the stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
            OpType::Upsert => "UPSERT",
            OpType::Gone => "GONE",
            OpType::Compensation => "COMPENSATION",
        }
    }

    /// Converts from the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(OpType::Insert),
            "UPDATE" => Some(OpType::Update),
            "DELETE" => Some(OpType::Delete),
            "UPSERT" => Some(OpType::Upsert),
            "GONE" => Some(OpType::Gone),
            "COMPENSATION" => Some(OpType::Compensation),
            _ => None,
        }
    }
}

/// A single entry in the local oplog.
///
/// Entries are written by capture triggers with a null timestamp; the
/// snapshot engine stamps them with the snapshot timestamp and their clear
/// tags. Primary-key columns are immutable; an update that would change one
/// is rejected at the trigger layer.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    /// Monotonic local id (assigned by the store).
    pub rowid: i64,
    /// Namespace of the affected table.
    pub namespace: String,
    /// Name of the affected table.
    pub tablename: String,
    /// Kind of operation.
    pub optype: OpType,
    /// Stable JSON of the primary-key columns.
    pub primary_key: String,
    /// Full row after the operation (inserts and updates).
    pub new_row: Option<Row>,
    /// Full row before the operation (updates and deletes).
    pub old_row: Option<Row>,
    /// Snapshot timestamp in UTC milliseconds; `None` until snapshotted.
    pub timestamp: Option<i64>,
    /// Encoded tag set this operation supersedes.
    pub clear_tags: String,
}

impl OplogEntry {
    /// Returns the qualified table this entry affects.
    pub fn qualified_table(&self) -> QualifiedTablename {
        QualifiedTablename::new(self.namespace.clone(), self.tablename.clone())
    }

    /// Decodes the entry's clear tags.
    pub fn decoded_clear_tags(&self) -> SatelliteResult<TagSet> {
        TagSet::decode(&self.clear_tags)
    }
}

/// The shadow row for a (table, primary key) that currently exists locally.
///
/// Deleted rows have no shadow entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowEntry {
    /// Namespace of the user table.
    pub namespace: String,
    /// Name of the user table.
    pub tablename: String,
    /// Stable JSON of the primary-key columns.
    pub primary_key: String,
    /// The observed causal history of the row.
    pub tags: TagSet,
}

impl ShadowEntry {
    /// Creates a shadow entry.
    pub fn new(
        namespace: impl Into<String>,
        tablename: impl Into<String>,
        primary_key: impl Into<String>,
        tags: TagSet,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            tablename: tablename.into(),
            primary_key: primary_key.into(),
            tags,
        }
    }

    /// Returns the qualified table this entry shadows.
    pub fn qualified_table(&self) -> QualifiedTablename {
        QualifiedTablename::new(self.namespace.clone(), self.tablename.clone())
    }
}

/// Groups oplog entries by qualified table, then by primary key, preserving
/// rowid order within each group.
pub fn group_by_primary_key(
    entries: &[OplogEntry],
) -> BTreeMap<QualifiedTablename, BTreeMap<String, Vec<&OplogEntry>>> {
    let mut grouped: BTreeMap<QualifiedTablename, BTreeMap<String, Vec<&OplogEntry>>> =
        BTreeMap::new();
    for entry in entries {
        grouped
            .entry(entry.qualified_table())
            .or_default()
            .entry(entry.primary_key.clone())
            .or_default()
            .push(entry);
    }
    grouped
}
