//! Replication protocol messages.

use satellite_core::{QualifiedTablename, Row};
use serde::{Deserialize, Serialize};

/// The kind of change carried by a [`DataChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    /// Row created.
    Insert,
    /// Row modified.
    Update,
    /// Row deleted.
    Delete,
    /// Row left every subscribed shape.
    Gone,
    /// Initial shape data for a new subscription.
    Initial,
}

/// A single row change inside a replicated transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChange {
    /// The affected table.
    pub relation: QualifiedTablename,
    /// The kind of change.
    pub change_type: ChangeType,
    /// The row after the change (inserts, updates, initial data).
    pub record: Option<Row>,
    /// The row before the change (updates, deletes).
    pub old_record: Option<Row>,
    /// Causal tags in wire form. For inserts and updates these are the
    /// row's new tags; for deletes the observed tags being cleared.
    pub tags: Vec<String>,
}

impl DataChange {
    /// Creates an insert change.
    pub fn insert(relation: QualifiedTablename, record: Row, tags: Vec<String>) -> Self {
        Self {
            relation,
            change_type: ChangeType::Insert,
            record: Some(record),
            old_record: None,
            tags,
        }
    }

    /// Creates an update change.
    pub fn update(
        relation: QualifiedTablename,
        record: Row,
        old_record: Option<Row>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            relation,
            change_type: ChangeType::Update,
            record: Some(record),
            old_record,
            tags,
        }
    }

    /// Creates a delete change.
    pub fn delete(relation: QualifiedTablename, old_record: Row, tags: Vec<String>) -> Self {
        Self {
            relation,
            change_type: ChangeType::Delete,
            record: None,
            old_record: Some(old_record),
            tags,
        }
    }

    /// Creates an initial shape-data change.
    pub fn initial(relation: QualifiedTablename, record: Row, tags: Vec<String>) -> Self {
        Self {
            relation,
            change_type: ChangeType::Initial,
            record: Some(record),
            old_record: None,
            tags,
        }
    }

    /// Creates a gone change.
    pub fn gone(relation: QualifiedTablename, old_record: Row) -> Self {
        Self {
            relation,
            change_type: ChangeType::Gone,
            record: None,
            old_record: Some(old_record),
            tags: Vec::new(),
        }
    }
}

/// A transaction received from or sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTransaction {
    /// Server-assigned position in the replication log.
    pub lsn: Vec<u8>,
    /// Commit timestamp in UTC milliseconds.
    pub commit_timestamp: i64,
    /// Client id of the originating writer; the server origin is a reserved
    /// string.
    pub origin: String,
    /// Row changes in commit order.
    pub changes: Vec<DataChange>,
}

/// Out-of-band rows referenced by a previously delivered transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalData {
    /// Reference number linking back to the triggering transaction.
    pub xid: i64,
    /// The additional row changes.
    pub changes: Vec<DataChange>,
}

/// A row reported gone by a [`GoneBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoneRow {
    /// The table the row left.
    pub tablename: QualifiedTablename,
    /// Primary-key columns of the departed row.
    pub record: Row,
}

/// Rows that left a shape after an unsubscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoneBatch {
    /// The subscription the rows belonged to.
    pub server_id: String,
    /// The departed rows.
    pub rows: Vec<GoneRow>,
}

/// A declarative shape: a predicate over a table selecting the rows to
/// replicate locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDef {
    /// The root table of the shape.
    pub tablename: String,
    /// Optional filter predicate over the root table.
    pub where_clause: Option<String>,
}

impl ShapeDef {
    /// Creates a whole-table shape.
    pub fn table(tablename: impl Into<String>) -> Self {
        Self {
            tablename: tablename.into(),
            where_clause: None,
        }
    }
}

/// A shape subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Client-chosen subscription id echoed by the server.
    pub subscription_id: String,
    /// The requested shapes.
    pub shapes: Vec<ShapeDef>,
}

/// The server's answer to a [`SubscribeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    /// The subscription this answers.
    pub subscription_id: String,
    /// Server error, if the subscription was rejected.
    pub error: Option<ServerErrorCode>,
}

/// A request to cancel shape subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    /// The subscriptions to cancel.
    pub subscription_ids: Vec<String>,
}

/// Error codes the server reports on the replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerErrorCode {
    /// Unclassified server failure.
    Internal,
    /// The supplied token has expired.
    AuthExpired,
    /// The client's LSN is outside the retained replication window.
    BehindWindow,
    /// The subscription referenced an unknown table.
    TableNotFound,
    /// Initial shape data could not be delivered.
    ShapeDeliveryError,
}

/// A message arriving on the inbound replication stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// A committed transaction.
    Transaction(DataTransaction),
    /// Out-of-band additional rows.
    AdditionalData(AdditionalData),
    /// Rows that left a shape.
    GoneBatch(GoneBatch),
    /// Initial data for an establishing subscription.
    ShapeData {
        /// The subscription the data belongs to.
        subscription_id: String,
        /// The initial rows as `Initial` changes.
        changes: Vec<DataChange>,
    },
    /// Acknowledgement that a subscription is established.
    SubscribeDelivered(SubscribeResponse),
    /// A stream-level error.
    Error(ServerErrorCode),
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_core::SqlValue;

    fn parent() -> QualifiedTablename {
        QualifiedTablename::new("main", "parent")
    }

    #[test]
    fn change_constructors() {
        let mut row = Row::new();
        row.insert("id".into(), SqlValue::from(1i64));

        let insert = DataChange::insert(parent(), row.clone(), vec!["remote@1".into()]);
        assert_eq!(insert.change_type, ChangeType::Insert);
        assert!(insert.record.is_some());
        assert!(insert.old_record.is_none());

        let delete = DataChange::delete(parent(), row.clone(), vec!["remote@1".into()]);
        assert_eq!(delete.change_type, ChangeType::Delete);
        assert!(delete.record.is_none());
        assert!(delete.old_record.is_some());

        let gone = DataChange::gone(parent(), row);
        assert_eq!(gone.change_type, ChangeType::Gone);
        assert!(gone.tags.is_empty());
    }

    #[test]
    fn transaction_serializes() {
        let mut row = Row::new();
        row.insert("id".into(), SqlValue::from(1i64));

        let tx = DataTransaction {
            lsn: vec![0, 0, 1],
            commit_timestamp: 42,
            origin: "remote".into(),
            changes: vec![DataChange::insert(parent(), row, vec![])],
        };

        let json = serde_json::to_string(&tx).unwrap();
        let back: DataTransaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn shape_def_table_helper() {
        let shape = ShapeDef::table("parent");
        assert_eq!(shape.tablename, "parent");
        assert!(shape.where_clause.is_none());
    }
}
