//! End-to-end tests for the assembled engine over in-memory SQLite.

use satellite_core::{
    OpType, OplogEntry, QualifiedTablename, Relation, RelationColumn, Relations, Row, SqlValue,
};
use satellite_engine::{
    ApplyEngine, ConnectionController, ConnectionState, DbAdapter, Dialect, FkChecks,
    MockReplicationClient, Notifier, OplogStore, QueryBuilder, SatelliteConfig, ShapeManager,
    SnapshotEngine, SqliteAdapter, Statement,
};
use satellite_proto::{DataChange, DataTransaction, ReplicationMessage, ShapeDef};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CLIENT: &str = "client-a";
const REMOTE: &str = "remote";

fn relations() -> Relations {
    let parent = QualifiedTablename::new("main", "parent");
    let mut relations = Relations::new();
    relations.insert(
        parent.clone(),
        Relation::new(
            parent,
            vec![
                RelationColumn {
                    name: "id".into(),
                    sql_type: "INTEGER".into(),
                    pk_index: Some(0),
                },
                RelationColumn {
                    name: "value".into(),
                    sql_type: "TEXT".into(),
                    pk_index: None,
                },
                RelationColumn {
                    name: "other".into(),
                    sql_type: "INTEGER".into(),
                    pk_index: None,
                },
            ],
        ),
    );
    relations
}

struct Harness {
    store: Arc<OplogStore<SqliteAdapter>>,
    client: Arc<MockReplicationClient>,
    shapes: Arc<ShapeManager<SqliteAdapter, MockReplicationClient>>,
    controller: Arc<ConnectionController<SqliteAdapter, MockReplicationClient>>,
}

fn harness() -> Harness {
    let config = SatelliteConfig::new("integration.db")
        .with_polling_interval(Duration::from_millis(1))
        .with_min_snapshot_window(Duration::from_millis(1));

    let adapter = Arc::new(SqliteAdapter::open_in_memory().unwrap());
    adapter
        .run(&Statement::simple(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY, value TEXT, other INTEGER)",
        ))
        .unwrap();

    let store = Arc::new(OplogStore::new(adapter, QueryBuilder::new(Dialect::Sqlite)));
    store.ensure_tables().unwrap();
    store.set_client_id(CLIENT).unwrap();

    let notifier = Arc::new(Notifier::new());
    let client = Arc::new(MockReplicationClient::new());
    let apply = Arc::new(ApplyEngine::new(
        Arc::clone(&store),
        Arc::clone(&notifier),
        CLIENT,
        relations(),
        FkChecks::Inherit,
        false,
    ));
    let snapshot = Arc::new(SnapshotEngine::new(
        Arc::clone(&store),
        Arc::clone(&notifier),
        CLIENT,
        relations(),
        config.polling_interval,
        config.min_snapshot_window,
    ));
    let shapes = Arc::new(ShapeManager::new(
        Arc::clone(&store),
        Arc::clone(&apply),
        Arc::clone(&client),
        Arc::clone(&notifier),
    ));
    let controller = Arc::new(ConnectionController::new(
        config,
        Arc::clone(&store),
        Arc::clone(&client),
        apply,
        snapshot,
        Arc::clone(&shapes),
        notifier,
    ));
    Harness {
        store,
        client,
        shapes,
        controller,
    }
}

fn parent_table() -> QualifiedTablename {
    QualifiedTablename::new("main", "parent")
}

fn row(pairs: &[(&str, SqlValue)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Simulates the capture trigger firing for a local write.
fn capture_local_write(
    harness: &Harness,
    optype: OpType,
    new_row: Option<Row>,
    old_row: Option<Row>,
) {
    let pk = r#"{"id":1}"#;
    if let Some(new_row) = &new_row {
        let columns: Vec<String> = new_row.keys().map(|c| format!("\"{c}\"")).collect();
        let placeholders: Vec<&str> = new_row.keys().map(|_| "?").collect();
        harness
            .store
            .adapter()
            .run(&Statement::new(
                format!(
                    "INSERT OR REPLACE INTO parent ({}) VALUES ({})",
                    columns.join(", "),
                    placeholders.join(", ")
                ),
                new_row.values().cloned().collect(),
            ))
            .unwrap();
    }
    harness
        .store
        .insert_raw_entry(&OplogEntry {
            rowid: 0,
            namespace: "main".into(),
            tablename: "parent".into(),
            optype,
            primary_key: pk.into(),
            new_row,
            old_row,
            timestamp: None,
            clear_tags: "[]".into(),
        })
        .unwrap();
}

fn query_parent(harness: &Harness, id: i64) -> Option<Row> {
    harness
        .store
        .adapter()
        .query(&Statement::new(
            "SELECT id, value, other FROM parent WHERE id = ?",
            vec![SqlValue::from(id)],
        ))
        .unwrap()
        .into_iter()
        .next()
}

/// Checks the shadow invariant: every user row has exactly one shadow entry
/// and every shadow entry has a user row.
fn assert_shadow_invariant(harness: &Harness) {
    let user_rows = harness
        .store
        .adapter()
        .query(&Statement::simple("SELECT id FROM parent"))
        .unwrap();
    for user_row in &user_rows {
        let SqlValue::Integer(id) = user_row["id"] else {
            panic!("non-integer id");
        };
        let pk = format!(r#"{{"id":{id}}}"#);
        assert!(
            harness
                .store
                .get_shadow(&parent_table(), &pk)
                .unwrap()
                .is_some(),
            "user row {pk} has no shadow entry"
        );
    }

    let shadows = harness
        .store
        .adapter()
        .query(&Statement::simple("SELECT primary_key FROM _electric_shadow"))
        .unwrap();
    assert_eq!(shadows.len(), user_rows.len(), "dangling shadow entries");
}

#[test]
fn local_write_round_trips_and_garbage_collects() {
    let harness = harness();
    harness.controller.start(None).unwrap();
    harness.controller.connect_with_backoff(|_, _| true).unwrap();

    capture_local_write(
        &harness,
        OpType::Insert,
        Some(row(&[
            ("id", SqlValue::from(1i64)),
            ("value", SqlValue::from("local")),
        ])),
        None,
    );

    // The tick snapshots and pushes the write upstream.
    harness.controller.tick(Instant::now()).unwrap();
    let sent = harness.client.sent_transactions();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].origin, CLIENT);
    let snapshot_ts = sent[0].commit_timestamp;

    // Exactly one oplog entry exists until acknowledgement.
    assert_eq!(harness.store.entries_since(None).unwrap().len(), 1);

    // The server echoes our transaction back with an LSN.
    harness
        .client
        .push_message(ReplicationMessage::Transaction(DataTransaction {
            lsn: vec![0, 7],
            commit_timestamp: snapshot_ts,
            origin: CLIENT.into(),
            changes: sent[0].changes.clone(),
        }));
    harness.controller.process_inbound().unwrap();

    // Acknowledged: zero entries remain, the LSN advanced, and the user
    // row is untouched.
    assert!(harness.store.entries_since(None).unwrap().is_empty());
    assert_eq!(harness.store.lsn().unwrap(), Some(vec![0, 7]));
    assert_eq!(
        query_parent(&harness, 1).unwrap()["value"],
        SqlValue::from("local")
    );
    assert_shadow_invariant(&harness);
}

#[test]
fn concurrent_writes_merge_under_lww() {
    let harness = harness();
    harness.controller.start(None).unwrap();
    harness.controller.connect_with_backoff(|_, _| true).unwrap();

    capture_local_write(
        &harness,
        OpType::Insert,
        Some(row(&[
            ("id", SqlValue::from(1i64)),
            ("value", SqlValue::from("local")),
            ("other", SqlValue::from(1i64)),
        ])),
        None,
    );
    harness.controller.tick(Instant::now()).unwrap();
    let snapshot_ts = harness.client.sent_transactions()[0].commit_timestamp;

    // A remote insert on the same key, one millisecond older: the local
    // value wins, the remote-only column is merged in.
    harness
        .client
        .push_message(ReplicationMessage::Transaction(DataTransaction {
            lsn: vec![1],
            commit_timestamp: snapshot_ts - 1,
            origin: REMOTE.into(),
            changes: vec![DataChange::insert(
                parent_table(),
                row(&[
                    ("id", SqlValue::from(1i64)),
                    ("value", SqlValue::from("incoming")),
                ]),
                vec![format!("{REMOTE}@{}", snapshot_ts - 1)],
            )],
        }));
    harness.controller.process_inbound().unwrap();

    let merged = query_parent(&harness, 1).unwrap();
    assert_eq!(merged["value"], SqlValue::from("local"));
    assert_eq!(merged["other"], SqlValue::from(1i64));

    let shadow = harness
        .store
        .get_shadow(&parent_table(), r#"{"id":1}"#)
        .unwrap()
        .unwrap();
    assert_eq!(shadow.tags.len(), 2);
    assert_shadow_invariant(&harness);
}

#[test]
fn applying_the_same_transaction_twice_is_idempotent() {
    let harness = harness();
    harness.controller.start(None).unwrap();
    harness.controller.connect_with_backoff(|_, _| true).unwrap();

    let tx = DataTransaction {
        lsn: vec![3],
        commit_timestamp: 5_000,
        origin: REMOTE.into(),
        changes: vec![DataChange::insert(
            parent_table(),
            row(&[
                ("id", SqlValue::from(1i64)),
                ("value", SqlValue::from("incoming")),
            ]),
            vec![format!("{REMOTE}@5000")],
        )],
    };

    harness
        .client
        .push_message(ReplicationMessage::Transaction(tx.clone()));
    harness.controller.process_inbound().unwrap();
    let first = query_parent(&harness, 1);
    let first_shadow = harness
        .store
        .get_shadow(&parent_table(), r#"{"id":1}"#)
        .unwrap();

    harness.client.push_message(ReplicationMessage::Transaction(tx));
    harness.controller.process_inbound().unwrap();

    assert_eq!(query_parent(&harness, 1), first);
    assert_eq!(
        harness
            .store
            .get_shadow(&parent_table(), r#"{"id":1}"#)
            .unwrap(),
        first_shadow
    );
    assert_shadow_invariant(&harness);
}

#[test]
fn offline_writes_flush_after_reconnect() {
    let harness = harness();
    harness.controller.start(None).unwrap();

    // Offline: writes snapshot locally without a connection.
    capture_local_write(
        &harness,
        OpType::Insert,
        Some(row(&[
            ("id", SqlValue::from(1i64)),
            ("value", SqlValue::from("offline")),
        ])),
        None,
    );
    harness.controller.tick(Instant::now()).unwrap();
    assert!(harness.client.sent_transactions().is_empty());
    assert_eq!(harness.store.entries_since(None).unwrap().len(), 1);

    // Reconnect, then the next tick flushes the backlog.
    harness.controller.connect_with_backoff(|_, _| true).unwrap();
    harness.controller.flush_outbound().unwrap();
    assert_eq!(harness.client.sent_transactions().len(), 1);
}

#[test]
fn shape_subscription_end_to_end() {
    let harness = harness();
    harness.controller.start(None).unwrap();
    harness.controller.connect_with_backoff(|_, _| true).unwrap();

    let rx = harness
        .shapes
        .subscribe("parent-shape", vec![ShapeDef::table("parent")])
        .unwrap();
    let server_id = harness
        .client
        .subscribe_requests()
        .last()
        .unwrap()
        .subscription_id
        .clone();

    // Initial shape data arrives on the stream.
    harness.client.push_message(ReplicationMessage::ShapeData {
        subscription_id: server_id,
        changes: vec![DataChange::initial(
            parent_table(),
            row(&[
                ("id", SqlValue::from(1i64)),
                ("value", SqlValue::from("shaped")),
            ]),
            vec!["server@1000".into()],
        )],
    });
    harness.controller.process_inbound().unwrap();

    rx.try_recv().unwrap().unwrap();
    assert_eq!(harness.shapes.active_count(), 1);
    assert_eq!(
        query_parent(&harness, 1).unwrap()["value"],
        SqlValue::from("shaped")
    );
    assert_shadow_invariant(&harness);

    // A local edit of the shaped row replicates upstream.
    capture_local_write(
        &harness,
        OpType::Update,
        Some(row(&[
            ("id", SqlValue::from(1i64)),
            ("value", SqlValue::from("edited")),
        ])),
        Some(row(&[
            ("id", SqlValue::from(1i64)),
            ("value", SqlValue::from("shaped")),
        ])),
    );
    harness.controller.tick(Instant::now()).unwrap();
    let sent = harness.client.sent_transactions();
    assert_eq!(sent.len(), 1);

    let update = &sent[0].changes[0];
    assert_eq!(update.record.as_ref().unwrap()["value"], SqlValue::from("edited"));
}

#[test]
fn disconnect_clears_shape_subscriptions() {
    let harness = harness();
    harness.controller.start(None).unwrap();
    harness.controller.connect_with_backoff(|_, _| true).unwrap();

    // One subscription made active, one still establishing.
    harness
        .shapes
        .subscribe("parent-shape", vec![ShapeDef::table("parent")])
        .unwrap();
    let server_id = harness
        .client
        .subscribe_requests()
        .last()
        .unwrap()
        .subscription_id
        .clone();
    harness.client.push_message(ReplicationMessage::ShapeData {
        subscription_id: server_id,
        changes: vec![DataChange::initial(
            parent_table(),
            row(&[("id", SqlValue::from(1i64))]),
            vec!["server@1000".into()],
        )],
    });
    harness.controller.process_inbound().unwrap();
    harness
        .shapes
        .subscribe(
            "pending-shape",
            vec![ShapeDef {
                tablename: "parent".into(),
                where_clause: Some("id = 2".into()),
            }],
        )
        .unwrap();
    assert_eq!(harness.shapes.active_count(), 1);

    harness.controller.disconnect();

    assert_eq!(harness.shapes.status("parent-shape"), None);
    assert_eq!(harness.shapes.status("pending-shape"), None);
    assert!(harness.shapes.is_empty().unwrap());
}

#[test]
fn disconnect_preserves_local_oplog() {
    let harness = harness();
    harness.controller.start(None).unwrap();
    harness.controller.connect_with_backoff(|_, _| true).unwrap();

    capture_local_write(
        &harness,
        OpType::Insert,
        Some(row(&[("id", SqlValue::from(1i64))])),
        None,
    );
    harness.controller.tick(Instant::now()).unwrap();
    assert_eq!(harness.store.entries_since(None).unwrap().len(), 1);

    harness.controller.disconnect();
    assert_eq!(harness.controller.state(), ConnectionState::Disconnected);
    assert_eq!(harness.store.entries_since(None).unwrap().len(), 1);
}
