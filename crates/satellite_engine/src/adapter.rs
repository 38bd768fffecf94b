//! Database adapter seam.
//!
//! The engine never talks to a database driver directly; it issues
//! [`Statement`]s through a [`DbAdapter`]. The accompanying [`QueryBuilder`]
//! supplies the dialect differences (parameter placeholders, identifier
//! quoting, Postgres-only fragments). Adapters must preserve binary column
//! values and 64-bit integers end to end.

use satellite_core::{QualifiedTablename, Row, SatelliteResult, SqlValue};

/// A SQL statement with positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// The SQL text.
    pub sql: String,
    /// Positional arguments.
    pub args: Vec<SqlValue>,
}

impl Statement {
    /// Creates a statement with arguments.
    pub fn new(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// Creates a statement without arguments.
    pub fn simple(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }
}

/// Executes SQL against the shared local database connection.
///
/// The single connection is shared by triggers, snapshotting, and apply; the
/// `transaction` primitive must provide at least read-committed isolation
/// and atomic commit.
pub trait DbAdapter {
    /// Runs a query and returns all rows.
    fn query(&self, stmt: &Statement) -> SatelliteResult<Vec<Row>>;

    /// Runs a statement and returns the number of affected rows.
    fn run(&self, stmt: &Statement) -> SatelliteResult<usize>;

    /// Runs several statements inside one transaction.
    fn run_in_transaction(&self, stmts: &[Statement]) -> SatelliteResult<()>
    where
        Self: Sized,
    {
        self.transaction(|adapter| {
            for stmt in stmts {
                adapter.run(stmt)?;
            }
            Ok(())
        })
    }

    /// Runs `f` inside a transaction, committing on `Ok` and rolling back on
    /// `Err`.
    fn transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> SatelliteResult<T>,
    ) -> SatelliteResult<T>
    where
        Self: Sized;
}

/// SQL dialect of the local database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Embedded SQLite.
    Sqlite,
    /// Server-side Postgres acting as a client.
    Postgres,
}

/// Builds dialect-specific SQL fragments.
#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder {
    dialect: Dialect,
}

impl QueryBuilder {
    /// Creates a builder for the given dialect.
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Returns the dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Returns the placeholder for the `i`-th positional parameter
    /// (1-based).
    pub fn make_positional_param(&self, i: usize) -> String {
        match self.dialect {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${i}"),
        }
    }

    /// Quotes a qualified table name for this dialect.
    pub fn make_qt(&self, table: &QualifiedTablename) -> String {
        format!("\"{}\".\"{}\"", table.namespace, table.tablename)
    }

    /// Returns `fragment` on Postgres and the empty string on SQLite.
    pub fn pg_only(&self, fragment: &str) -> String {
        match self.dialect {
            Dialect::Sqlite => String::new(),
            Dialect::Postgres => fragment.to_string(),
        }
    }

    /// Returns the default namespace of this dialect.
    pub fn default_namespace(&self) -> &'static str {
        match self.dialect {
            Dialect::Sqlite => "main",
            Dialect::Postgres => "public",
        }
    }

    /// Returns a query listing the user tables of the local database as
    /// rows with a `name` column.
    pub fn local_tables_statement(&self) -> Statement {
        match self.dialect {
            Dialect::Sqlite => Statement::simple(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '\\_electric\\_%' ESCAPE '\\' \
                 ORDER BY name",
            ),
            Dialect::Postgres => Statement::simple(
                "SELECT table_name AS name FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_name NOT LIKE '_electric_%' \
                 ORDER BY table_name",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_params() {
        let sqlite = QueryBuilder::new(Dialect::Sqlite);
        let postgres = QueryBuilder::new(Dialect::Postgres);

        assert_eq!(sqlite.make_positional_param(1), "?");
        assert_eq!(sqlite.make_positional_param(3), "?");
        assert_eq!(postgres.make_positional_param(1), "$1");
        assert_eq!(postgres.make_positional_param(3), "$3");
    }

    #[test]
    fn quoted_tables() {
        let qb = QueryBuilder::new(Dialect::Sqlite);
        let table = QualifiedTablename::new("main", "parent");
        assert_eq!(qb.make_qt(&table), "\"main\".\"parent\"");
    }

    #[test]
    fn pg_only_fragments() {
        let sqlite = QueryBuilder::new(Dialect::Sqlite);
        let postgres = QueryBuilder::new(Dialect::Postgres);

        assert_eq!(sqlite.pg_only("SET CONSTRAINTS ALL DEFERRED"), "");
        assert_eq!(
            postgres.pg_only("SET CONSTRAINTS ALL DEFERRED"),
            "SET CONSTRAINTS ALL DEFERRED"
        );
    }

    #[test]
    fn default_namespaces() {
        assert_eq!(QueryBuilder::new(Dialect::Sqlite).default_namespace(), "main");
        assert_eq!(
            QueryBuilder::new(Dialect::Postgres).default_namespace(),
            "public"
        );
    }
}
