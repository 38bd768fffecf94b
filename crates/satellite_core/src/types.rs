//! SQL value model and table metadata.
//!
//! Values are owned and preserve byte arrays and 64-bit integers end to end.
//! Primary keys are encoded as canonical JSON (sorted column names, blobs as
//! base64) so the same key always produces the same string.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An owned SQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// Double-precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Returns true if this is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Converts to a JSON value for primary-key encoding.
    ///
    /// Blobs become base64 text so the key stays a valid JSON string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Integer(i) => serde_json::Value::from(*i),
            SqlValue::Real(r) => serde_json::Value::from(*r),
            SqlValue::Text(s) => serde_json::Value::from(s.clone()),
            SqlValue::Blob(b) => {
                serde_json::Value::from(base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

/// A row as a sorted column-name → value map.
///
/// The sorted map keeps derived encodings canonical.
pub type Row = BTreeMap<String, SqlValue>;

/// A namespace-qualified table name.
///
/// Namespaces are first-class: `main` for SQLite, a schema name for
/// Postgres.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedTablename {
    /// Namespace (schema) component.
    pub namespace: String,
    /// Table name component.
    pub tablename: String,
}

impl QualifiedTablename {
    /// Creates a qualified table name.
    pub fn new(namespace: impl Into<String>, tablename: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tablename: tablename.into(),
        }
    }
}

impl fmt::Display for QualifiedTablename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.namespace, self.tablename)
    }
}

/// A column in a replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationColumn {
    /// Column name.
    pub name: String,
    /// Declared SQL type.
    pub sql_type: String,
    /// Position within the primary key, if part of it (0-based).
    pub pk_index: Option<usize>,
}

/// A foreign-key edge from a child table to a parent table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing columns on the child table.
    pub child_columns: Vec<String>,
    /// The referenced parent table.
    pub parent_table: QualifiedTablename,
    /// Referenced columns on the parent table.
    pub parent_columns: Vec<String>,
}

/// Metadata for a replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// The table this relation describes.
    pub table: QualifiedTablename,
    /// Columns in declaration order.
    pub columns: Vec<RelationColumn>,
    /// Outgoing foreign keys (this table is the child).
    pub foreign_keys: Vec<ForeignKey>,
}

impl Relation {
    /// Creates a relation with no foreign keys.
    pub fn new(table: QualifiedTablename, columns: Vec<RelationColumn>) -> Self {
        Self {
            table,
            columns,
            foreign_keys: Vec::new(),
        }
    }

    /// Adds a foreign key.
    pub fn with_foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Returns the primary-key column names in key order.
    pub fn pk_columns(&self) -> Vec<&str> {
        let mut pks: Vec<(&RelationColumn, usize)> = self
            .columns
            .iter()
            .filter_map(|c| c.pk_index.map(|i| (c, i)))
            .collect();
        pks.sort_by_key(|(_, i)| *i);
        pks.into_iter().map(|(c, _)| c.name.as_str()).collect()
    }

    /// Returns all column names in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Encodes the primary-key columns of `row` as a stable JSON string.
    pub fn primary_key_json(&self, row: &Row) -> String {
        let mut pk = serde_json::Map::new();
        for name in self.pk_columns() {
            let value = row.get(name).map(SqlValue::to_json).unwrap_or_default();
            pk.insert(name.to_string(), value);
        }
        serde_json::Value::Object(pk).to_string()
    }
}

/// Table metadata keyed by qualified table name.
///
/// Relations are an immutable parameter of a replication session; a new map
/// is built on reconnect rather than mutated in place.
pub type Relations = BTreeMap<QualifiedTablename, Relation>;

/// Orders tables so that children sort before the parents they reference.
///
/// Used when garbage-collecting shape rows: deleting in this order never
/// breaks a foreign key in the user's schema. Cycles fall back to the input
/// order.
pub fn reverse_fk_order<'a>(
    relations: &'a Relations,
    tables: &[&'a QualifiedTablename],
) -> Vec<&'a QualifiedTablename> {
    let mut remaining: Vec<&QualifiedTablename> = tables.to_vec();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        // A table is safe to delete from when no other remaining table
        // references it.
        let idx = remaining.iter().position(|candidate| {
            !remaining.iter().any(|other| {
                other != candidate
                    && relations
                        .get(*other)
                        .map(|r| r.foreign_keys.iter().any(|fk| &fk.parent_table == *candidate))
                        .unwrap_or(false)
            })
        });
        match idx {
            Some(i) => ordered.push(remaining.remove(i)),
            None => {
                ordered.extend(remaining.drain(..));
            }
        }
    }
    ordered
}
