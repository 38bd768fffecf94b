//! SQLite implementation of the database adapter.
//!
//! Uses rusqlite with bundled SQLite. The connection is protected by a
//! mutex; transactions release it between statements so nested calls from
//! inside a `transaction` closure do not deadlock. The engine itself is
//! single-threaded cooperative, so the mutex only guards against host
//! misuse.

use crate::adapter::{DbAdapter, Statement};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use satellite_core::{Row, SatelliteError, SatelliteResult, SqlValue};
use std::path::Path;

/// A SQLite-backed [`DbAdapter`].
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
}

impl SqliteAdapter {
    /// Opens a database file, creating it if absent.
    pub fn open(path: impl AsRef<Path>) -> SatelliteResult<Self> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        Self::configure(conn)
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> SatelliteResult<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> SatelliteResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(sqlite_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn bind_params(stmt: &Statement) -> Vec<rusqlite::types::Value> {
        stmt.args.iter().map(to_sqlite_value).collect()
    }
}

fn sqlite_err(e: rusqlite::Error) -> SatelliteError {
    // Foreign-key failures surface with their own kind so the apply engine
    // and shape manager can route them.
    if let rusqlite::Error::SqliteFailure(inner, _) = &e {
        if inner.code == rusqlite::ErrorCode::ConstraintViolation {
            return SatelliteError::fk_violation(e.to_string());
        }
    }
    SatelliteError::internal(format!("sqlite: {e}"))
}

fn to_sqlite_value(value: &SqlValue) -> rusqlite::types::Value {
    match value {
        SqlValue::Null => rusqlite::types::Value::Null,
        SqlValue::Integer(i) => rusqlite::types::Value::Integer(*i),
        SqlValue::Real(r) => rusqlite::types::Value::Real(*r),
        SqlValue::Text(s) => rusqlite::types::Value::Text(s.clone()),
        SqlValue::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
    }
}

fn from_sqlite_value(value: ValueRef<'_>) -> SatelliteResult<SqlValue> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(t) => SqlValue::Text(
            std::str::from_utf8(t)
                .map_err(|e| SatelliteError::internal(format!("non-utf8 text column: {e}")))?
                .to_string(),
        ),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    })
}

impl DbAdapter for SqliteAdapter {
    fn query(&self, stmt: &Statement) -> SatelliteResult<Vec<Row>> {
        let conn = self.conn.lock();
        let mut prepared = conn.prepare(&stmt.sql).map_err(sqlite_err)?;
        let column_names: Vec<String> =
            prepared.column_names().iter().map(|s| s.to_string()).collect();

        let params = Self::bind_params(stmt);
        let mut rows = prepared
            .query(rusqlite::params_from_iter(params))
            .map_err(sqlite_err)?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().map_err(sqlite_err)? {
            let mut out = Row::new();
            for (i, name) in column_names.iter().enumerate() {
                let value = row.get_ref(i).map_err(sqlite_err)?;
                out.insert(name.clone(), from_sqlite_value(value)?);
            }
            result.push(out);
        }
        Ok(result)
    }

    fn run(&self, stmt: &Statement) -> SatelliteResult<usize> {
        let conn = self.conn.lock();
        let params = Self::bind_params(stmt);
        conn.execute(&stmt.sql, rusqlite::params_from_iter(params))
            .map_err(sqlite_err)
    }

    fn transaction<T>(&self, f: impl FnOnce(&Self) -> SatelliteResult<T>) -> SatelliteResult<T> {
        {
            let conn = self.conn.lock();
            conn.execute_batch("BEGIN IMMEDIATE").map_err(sqlite_err)?;
        }

        match f(self) {
            Ok(value) => {
                let conn = self.conn.lock();
                conn.execute_batch("COMMIT").map_err(sqlite_err)?;
                Ok(value)
            }
            Err(e) => {
                let conn = self.conn.lock();
                // Rollback failure is secondary to the original error.
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}
