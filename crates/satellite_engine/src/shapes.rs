//! Shape subscription manager.
//!
//! One state machine per caller-supplied subscription key:
//!
//! ```text
//! (none) ──subscribe──► establishing ──data delivered──► active
//!                         │    ▲                           │
//!                         │    └──── retry on reconnect    │ change shape
//!                         │                                ▼
//!                         │ delivery error        establishing (replace)
//!                         ▼                                │
//!                        gone ◄──── cancelling ◄───────────┘
//! ```
//!
//! Establishing carries a progress marker: `receiving_data` during the
//! initial fetch, `removing_data` while garbage-collecting rows of a shape
//! this one replaced. Identical concurrent subscribes collapse onto one
//! server request and share one `synced` outcome. Manager state is
//! persisted into the `subscriptions` meta key after every transition and
//! unfulfilled records are retried on reconnect.

use crate::adapter::DbAdapter;
use crate::apply::ApplyEngine;
use crate::client::ReplicationClient;
use crate::notifier::{Notifier, ShapeStateNotification};
use crate::store::{OplogStore, META_SUBSCRIPTIONS};
use crate::snapshot::now_millis;
use parking_lot::Mutex;
use satellite_core::{
    QualifiedTablename, SatelliteError, SatelliteResult, SqlValue, SERVER_ORIGIN,
};
use satellite_proto::{DataChange, ShapeDef, SubscribeRequest, UnsubscribeRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Progress of an establishing subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The initial data fetch is in flight.
    ReceivingData,
    /// Rows of the replaced shape are being garbage-collected.
    RemovingData,
}

/// Externally observable subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Waiting for the server to accept and deliver initial data.
    Establishing(Progress),
    /// Initial data applied; the shape is live.
    Active,
    /// An unsubscribe is in flight.
    Cancelling,
}

impl SubscriptionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Establishing(_) => "establishing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelling => "cancelling",
        }
    }
}

/// The outcome delivered on a subscription's `synced` channel.
pub type SyncedOutcome = SatelliteResult<()>;

#[derive(Debug, Clone)]
struct SubscriptionRecord {
    server_id: String,
    shapes: Vec<ShapeDef>,
    old_server_id: Option<String>,
    progress: Progress,
}

type ShapeRows = BTreeMap<QualifiedTablename, BTreeSet<String>>;

#[derive(Default)]
struct ManagerState {
    active: BTreeMap<String, SubscriptionRecord>,
    establishing: BTreeMap<String, SubscriptionRecord>,
    unsubscribes: BTreeSet<String>,
    shape_rows: BTreeMap<String, ShapeRows>,
    waiters: BTreeMap<String, Vec<Sender<SyncedOutcome>>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedTableRows {
    namespace: String,
    tablename: String,
    pks: BTreeSet<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedSubscription {
    server_id: String,
    shapes: Vec<ShapeDef>,
    old_server_id: Option<String>,
}

/// Serialized manager state stored under the `subscriptions` meta key.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    active: BTreeMap<String, PersistedSubscription>,
    known: BTreeMap<String, String>,
    unfulfilled: BTreeMap<String, PersistedSubscription>,
    unsubscribes: BTreeSet<String>,
    shape_rows: BTreeMap<String, Vec<PersistedTableRows>>,
}

/// Drives shape subscriptions against the server and keeps their local
/// rows in sync.
pub struct ShapeManager<A: DbAdapter, C: ReplicationClient> {
    store: Arc<OplogStore<A>>,
    apply: Arc<ApplyEngine<A>>,
    client: Arc<C>,
    notifier: Arc<Notifier>,
    state: Mutex<ManagerState>,
}

impl<A: DbAdapter, C: ReplicationClient> ShapeManager<A, C> {
    /// Creates a shape manager.
    pub fn new(
        store: Arc<OplogStore<A>>,
        apply: Arc<ApplyEngine<A>>,
        client: Arc<C>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            apply,
            client,
            notifier,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Restores persisted manager state from the meta table.
    pub fn load(&self) -> SatelliteResult<()> {
        let Some(blob) = self.store.get_meta(META_SUBSCRIPTIONS)? else {
            return Ok(());
        };
        let persisted: PersistedState = serde_json::from_str(&blob)
            .map_err(|e| SatelliteError::internal(format!("corrupt subscriptions meta: {e}")))?;

        let mut state = self.state.lock();
        for (key, sub) in persisted.active {
            state.active.insert(
                key,
                SubscriptionRecord {
                    server_id: sub.server_id,
                    shapes: sub.shapes,
                    old_server_id: sub.old_server_id,
                    progress: Progress::ReceivingData,
                },
            );
        }
        for (key, sub) in persisted.unfulfilled {
            state.establishing.insert(
                key,
                SubscriptionRecord {
                    server_id: sub.server_id,
                    shapes: sub.shapes,
                    old_server_id: sub.old_server_id,
                    progress: Progress::ReceivingData,
                },
            );
        }
        state.unsubscribes = persisted.unsubscribes;
        for (server_id, tables) in persisted.shape_rows {
            let mut rows = ShapeRows::new();
            for table in tables {
                rows.insert(
                    QualifiedTablename::new(table.namespace, table.tablename),
                    table.pks,
                );
            }
            state.shape_rows.insert(server_id, rows);
        }
        Ok(())
    }

    /// Requests a subscription for `key`.
    ///
    /// Identical concurrent subscribes share one server request; the
    /// returned channel resolves when the shape becomes active or the
    /// attempt fails. Subscribing with different shapes on an existing key
    /// replaces the prior shape.
    pub fn subscribe(
        &self,
        key: &str,
        shapes: Vec<ShapeDef>,
    ) -> SatelliteResult<Receiver<SyncedOutcome>> {
        let (tx, rx) = mpsc::channel();
        let request = {
            let mut state = self.state.lock();

            if let Some(record) = state.active.get(key) {
                if record.shapes == shapes {
                    // Already live; resolve immediately.
                    let _ = tx.send(Ok(()));
                    return Ok(rx);
                }
            }
            if let Some(record) = state.establishing.get(key) {
                if record.shapes == shapes {
                    // Dedup onto the in-flight attempt.
                    state.waiters.entry(key.to_string()).or_default().push(tx);
                    return Ok(rx);
                }
            }

            // A different shape replaces the prior one; data still in
            // flight for the replaced attempt belongs to its old server id
            // and will be discarded.
            let old_server_id = state
                .establishing
                .remove(key)
                .map(|r| r.server_id)
                .or_else(|| state.active.remove(key).map(|r| r.server_id));

            let server_id = Uuid::new_v4().to_string();
            state.establishing.insert(
                key.to_string(),
                SubscriptionRecord {
                    server_id: server_id.clone(),
                    shapes: shapes.clone(),
                    old_server_id,
                    progress: Progress::ReceivingData,
                },
            );
            state.waiters.entry(key.to_string()).or_default().push(tx);
            self.persist_locked(&state)?;

            SubscribeRequest {
                subscription_id: server_id,
                shapes,
            }
        };

        self.notify(key, SubscriptionStatus::Establishing(Progress::ReceivingData));

        if let Err(error) = self.client.subscribe(&request) {
            warn!(key, %error, "subscribe request failed");
            self.fail_and_reset(key, error)?;
            return Ok(rx);
        }
        Ok(rx)
    }

    /// Applies the initial data batch for an establishing subscription.
    ///
    /// Data for a server id that is no longer establishing (a replaced
    /// attempt) is discarded. Delivery failures roll back every row of the
    /// attempt, reset the manager, and surface the error on `synced`.
    pub fn handle_shape_data(
        &self,
        server_id: &str,
        changes: &[DataChange],
    ) -> SatelliteResult<()> {
        let key = {
            let state = self.state.lock();
            state
                .establishing
                .iter()
                .find(|(_, r)| r.server_id == server_id)
                .map(|(k, _)| k.clone())
        };
        let Some(key) = key else {
            debug!(server_id, "discarding shape data for replaced subscription");
            return Ok(());
        };

        let delivered = self
            .store
            .adapter()
            .transaction(|_| self.apply.apply_shape_data(SERVER_ORIGIN, now_millis(), changes));

        match delivered {
            Ok(delivered) => {
                let old = {
                    let mut state = self.state.lock();
                    state.shape_rows.insert(server_id.to_string(), delivered);
                    let record = state.establishing.get_mut(&key).ok_or_else(|| {
                        SatelliteError::internal("establishing record vanished mid-delivery")
                    })?;
                    record.old_server_id.take()
                };

                if let Some(old_server_id) = &old {
                    self.notify(&key, SubscriptionStatus::Establishing(Progress::RemovingData));
                    {
                        let mut state = self.state.lock();
                        if let Some(record) = state.establishing.get_mut(&key) {
                            record.progress = Progress::RemovingData;
                        }
                    }
                    self.remove_replaced_rows(old_server_id)?;
                }

                {
                    let mut state = self.state.lock();
                    if let Some(record) = state.establishing.remove(&key) {
                        state.active.insert(key.clone(), record);
                    }
                    self.fulfill_waiters_locked(&mut state, &key, Ok(()));
                    self.persist_locked(&state)?;
                }
                self.notify(&key, SubscriptionStatus::Active);
                Ok(())
            }
            Err(error) => {
                warn!(%key, %error, "shape delivery failed");
                self.fail_and_reset(
                    &key,
                    SatelliteError::shape_delivery(error.to_string()),
                )?;
                Ok(())
            }
        }
    }

    /// Cancels the subscriptions for `keys` and garbage-collects the rows
    /// uniquely covered by their shapes.
    pub fn unsubscribe(&self, keys: &[&str]) -> SatelliteResult<()> {
        let mut server_ids = Vec::new();
        {
            let mut state = self.state.lock();
            for key in keys {
                if let Some(record) = state.active.remove(*key) {
                    state.unsubscribes.insert(record.server_id.clone());
                    server_ids.push(record.server_id);
                }
            }
            if server_ids.is_empty() {
                return Ok(());
            }
            self.persist_locked(&state)?;
        }
        for key in keys {
            self.notify(key, SubscriptionStatus::Cancelling);
        }

        self.client.unsubscribe(&UnsubscribeRequest {
            subscription_ids: server_ids.clone(),
        })?;

        for server_id in &server_ids {
            self.remove_replaced_rows(server_id)?;
        }

        {
            let mut state = self.state.lock();
            for server_id in &server_ids {
                state.unsubscribes.remove(server_id);
            }
            self.persist_locked(&state)?;
        }
        for key in keys {
            self.notifier.emit_shape_state(ShapeStateNotification {
                key: key.to_string(),
                status: "gone".into(),
            });
        }
        Ok(())
    }

    /// Re-issues subscribe requests for unfulfilled subscriptions after a
    /// reconnect.
    pub fn retry_unfulfilled(&self) -> SatelliteResult<()> {
        let requests: Vec<SubscribeRequest> = {
            let state = self.state.lock();
            state
                .establishing
                .values()
                .map(|record| SubscribeRequest {
                    subscription_id: record.server_id.clone(),
                    shapes: record.shapes.clone(),
                })
                .collect()
        };
        for request in requests {
            self.client.subscribe(&request)?;
        }
        Ok(())
    }

    /// Moves every active subscription back to establishing and re-issues
    /// its subscribe request. Used after a BEHIND_WINDOW reset, when the
    /// local copies of all shapes were discarded.
    pub fn resubscribe_active(&self) -> SatelliteResult<()> {
        let requests: Vec<(String, SubscribeRequest)> = {
            let mut state = self.state.lock();
            let keys: Vec<String> = state.active.keys().cloned().collect();
            let mut requests = Vec::with_capacity(keys.len());
            for key in keys {
                let mut record = match state.active.remove(&key) {
                    Some(record) => record,
                    None => continue,
                };
                // The old server id's data is gone with the reset.
                record.server_id = Uuid::new_v4().to_string();
                record.old_server_id = None;
                record.progress = Progress::ReceivingData;
                requests.push((
                    key.clone(),
                    SubscribeRequest {
                        subscription_id: record.server_id.clone(),
                        shapes: record.shapes.clone(),
                    },
                ));
                state.establishing.insert(key, record);
            }
            state.shape_rows.clear();
            self.persist_locked(&state)?;
            requests
        };

        for (key, request) in requests {
            self.notify(&key, SubscriptionStatus::Establishing(Progress::ReceivingData));
            self.client.subscribe(&request)?;
        }
        Ok(())
    }

    /// Returns the server ids of active subscriptions, for stream resume.
    pub fn active_subscription_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .active
            .values()
            .map(|r| r.server_id.clone())
            .collect()
    }

    /// Returns the status of the subscription for `key`.
    pub fn status(&self, key: &str) -> Option<SubscriptionStatus> {
        let state = self.state.lock();
        if let Some(record) = state.establishing.get(key) {
            return Some(SubscriptionStatus::Establishing(record.progress));
        }
        if state.active.contains_key(key) {
            return Some(SubscriptionStatus::Active);
        }
        None
    }

    /// Returns the number of active subscriptions.
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Returns true if no subscription state remains, in memory or
    /// persisted.
    pub fn is_empty(&self) -> SatelliteResult<bool> {
        let state = self.state.lock();
        let in_memory_empty = state.active.is_empty()
            && state.establishing.is_empty()
            && state.unsubscribes.is_empty()
            && state.shape_rows.is_empty();
        drop(state);

        let persisted_empty = match self.store.get_meta(META_SUBSCRIPTIONS)? {
            None => true,
            Some(blob) => {
                let persisted: PersistedState = serde_json::from_str(&blob).map_err(|e| {
                    SatelliteError::internal(format!("corrupt subscriptions meta: {e}"))
                })?;
                persisted.active.is_empty()
                    && persisted.known.is_empty()
                    && persisted.unfulfilled.is_empty()
                    && persisted.unsubscribes.is_empty()
            }
        };
        Ok(in_memory_empty && persisted_empty)
    }

    /// Drops every subscription and persists the empty state.
    pub fn reset_all(&self) -> SatelliteResult<()> {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .active
            .keys()
            .chain(state.establishing.keys())
            .cloned()
            .collect();
        state.active.clear();
        state.establishing.clear();
        state.unsubscribes.clear();
        state.shape_rows.clear();
        for key in keys {
            self.fulfill_waiters_locked(
                &mut state,
                &key,
                Err(SatelliteError::shape_delivery("subscription state reset")),
            );
        }
        state.waiters.clear();
        self.persist_locked(&state)
    }

    /// Fails `key`, resets all subscription state, and notifies waiters.
    fn fail_and_reset(&self, key: &str, error: SatelliteError) -> SatelliteResult<()> {
        {
            let mut state = self.state.lock();
            state.active.clear();
            state.establishing.clear();
            state.unsubscribes.clear();
            state.shape_rows.clear();

            let keys: Vec<String> = state.waiters.keys().cloned().collect();
            for waiter_key in keys {
                let outcome = if waiter_key == key {
                    Err(error.clone())
                } else {
                    Err(SatelliteError::shape_delivery("subscription state reset"))
                };
                self.fulfill_waiters_locked(&mut state, &waiter_key, outcome);
            }
            self.persist_locked(&state)?;
        }
        self.notifier.emit_shape_state(ShapeStateNotification {
            key: key.to_string(),
            status: "gone".into(),
        });
        Ok(())
    }

    /// Deletes rows of `server_id`'s shape that no other live subscription
    /// still covers, children before parents, in one transaction.
    fn remove_replaced_rows(&self, server_id: &str) -> SatelliteResult<()> {
        let (rows, still_covered) = {
            let mut state = self.state.lock();
            let rows = state.shape_rows.remove(server_id).unwrap_or_default();

            let mut still_covered: ShapeRows = ShapeRows::new();
            for other_rows in state.shape_rows.values() {
                for (table, pks) in other_rows {
                    still_covered
                        .entry(table.clone())
                        .or_default()
                        .extend(pks.iter().cloned());
                }
            }
            (rows, still_covered)
        };

        if rows.is_empty() {
            return Ok(());
        }

        let relations = self.apply.relations().clone();
        self.store.adapter().transaction(|_| {
            let tables: Vec<&QualifiedTablename> = rows.keys().collect();
            let ordered = satellite_core::types::reverse_fk_order(&relations, &tables);

            for &table in &ordered {
                let relation = relations
                    .get(table)
                    .ok_or_else(|| SatelliteError::table_not_found(table.to_string()))?;
                let covered = still_covered.get(table);

                for pk in &rows[table] {
                    if covered.map(|c| c.contains(pk)).unwrap_or(false) {
                        continue;
                    }
                    let (predicate, args) = pk_predicate(relation, pk, self.store.builder())?;
                    self.store.adapter().run(&crate::adapter::Statement::new(
                        format!(
                            "DELETE FROM {} WHERE {predicate}",
                            self.store.builder().make_qt(table)
                        ),
                        args,
                    ))?;
                    self.store.delete_shadow(table, pk)?;
                }
            }
            Ok(())
        })
    }

    fn fulfill_waiters_locked(
        &self,
        state: &mut ManagerState,
        key: &str,
        outcome: SyncedOutcome,
    ) {
        if let Some(waiters) = state.waiters.remove(key) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    fn persist_locked(&self, state: &ManagerState) -> SatelliteResult<()> {
        let mut persisted = PersistedState::default();
        for (key, record) in &state.active {
            persisted.known.insert(record.server_id.clone(), key.clone());
            persisted.active.insert(
                key.clone(),
                PersistedSubscription {
                    server_id: record.server_id.clone(),
                    shapes: record.shapes.clone(),
                    old_server_id: record.old_server_id.clone(),
                },
            );
        }
        for (key, record) in &state.establishing {
            persisted.known.insert(record.server_id.clone(), key.clone());
            persisted.unfulfilled.insert(
                key.clone(),
                PersistedSubscription {
                    server_id: record.server_id.clone(),
                    shapes: record.shapes.clone(),
                    old_server_id: record.old_server_id.clone(),
                },
            );
        }
        persisted.unsubscribes = state.unsubscribes.clone();
        for (server_id, rows) in &state.shape_rows {
            let tables = rows
                .iter()
                .map(|(table, pks)| PersistedTableRows {
                    namespace: table.namespace.clone(),
                    tablename: table.tablename.clone(),
                    pks: pks.clone(),
                })
                .collect();
            persisted.shape_rows.insert(server_id.clone(), tables);
        }

        let blob = serde_json::to_string(&persisted)
            .map_err(|e| SatelliteError::internal(format!("subscriptions serialization: {e}")))?;
        self.store.set_meta(META_SUBSCRIPTIONS, &blob)
    }

    fn notify(&self, key: &str, status: SubscriptionStatus) {
        self.notifier.emit_shape_state(ShapeStateNotification {
            key: key.to_string(),
            status: status.as_str().into(),
        });
    }
}

/// Builds a primary-key WHERE predicate from a stored pk JSON string.
fn pk_predicate(
    relation: &satellite_core::Relation,
    pk_json: &str,
    builder: crate::adapter::QueryBuilder,
) -> SatelliteResult<(String, Vec<SqlValue>)> {
    let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(pk_json)
        .map_err(|e| SatelliteError::internal(format!("corrupt primary key json: {e}")))?;

    let mut predicate = Vec::new();
    let mut args = Vec::new();
    for (i, column) in relation.pk_columns().iter().enumerate() {
        let value = parsed
            .get(*column)
            .ok_or_else(|| SatelliteError::internal(format!("primary key missing {column}")))?;
        predicate.push(format!(
            "\"{column}\" = {}",
            builder.make_positional_param(i + 1)
        ));
        args.push(json_to_sql(value));
    }
    Ok((predicate.join(" AND "), args))
}

fn json_to_sql(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .unwrap_or_else(|| SqlValue::Real(n.as_f64().unwrap_or(0.0))),
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Dialect, QueryBuilder, Statement};
    use crate::client::MockReplicationClient;
    use crate::config::FkChecks;
    use crate::sqlite::SqliteAdapter;
    use satellite_core::{Relation, RelationColumn, Relations, Row};

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
                ],
            ),
        );
        relations
    }

    struct Fixture {
        store: Arc<OplogStore<SqliteAdapter>>,
        client: Arc<MockReplicationClient>,
        manager: ShapeManager<SqliteAdapter, MockReplicationClient>,
    }

    fn fixture() -> Fixture {
        let adapter = Arc::new(SqliteAdapter::open_in_memory().unwrap());
        adapter
            .run(&Statement::simple(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY, value TEXT)",
            ))
            .unwrap();

        let store = Arc::new(OplogStore::new(adapter, QueryBuilder::new(Dialect::Sqlite)));
        store.ensure_tables().unwrap();

        let notifier = Arc::new(Notifier::new());
        let apply = Arc::new(ApplyEngine::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            "client-a",
            relations(),
            FkChecks::Inherit,
            false,
        ));
        let client = Arc::new(MockReplicationClient::new());
        let manager = ShapeManager::new(
            Arc::clone(&store),
            apply,
            Arc::clone(&client),
            notifier,
        );
        Fixture {
            store,
            client,
            manager,
        }
    }

    fn parent_table() -> QualifiedTablename {
        QualifiedTablename::new("main", "parent")
    }

    fn initial_change(id: i64) -> DataChange {
        let mut row = Row::new();
        row.insert("id".into(), SqlValue::from(id));
        row.insert("value".into(), SqlValue::from("shaped"));
        DataChange::initial(parent_table(), row, vec![format!("{SERVER_ORIGIN}@1000")])
    }

    fn server_id(fixture: &Fixture) -> String {
        fixture
            .client
            .subscribe_requests()
            .last()
            .unwrap()
            .subscription_id
            .clone()
    }

    #[test]
    fn subscribe_then_deliver_becomes_active() {
        let fixture = fixture();

        let rx = fixture
            .manager
            .subscribe("key-1", vec![ShapeDef::table("parent")])
            .unwrap();
        assert_eq!(
            fixture.manager.status("key-1"),
            Some(SubscriptionStatus::Establishing(Progress::ReceivingData))
        );

        let sid = server_id(&fixture);
        fixture
            .manager
            .handle_shape_data(&sid, &[initial_change(1)])
            .unwrap();

        assert_eq!(fixture.manager.status("key-1"), Some(SubscriptionStatus::Active));
        rx.try_recv().unwrap().unwrap();

        // The shape row landed in the user table with a shadow entry.
        let rows = fixture
            .store
            .adapter()
            .query(&Statement::simple("SELECT id FROM parent"))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(fixture
            .store
            .get_shadow(&parent_table(), r#"{"id":1}"#)
            .unwrap()
            .is_some());
    }

    #[test]
    fn overlapping_identical_subscribes_dedupe() {
        let fixture = fixture();
        let shapes = vec![ShapeDef::table("parent")];

        let receivers: Vec<_> = (0..4)
            .map(|_| fixture.manager.subscribe("key-1", shapes.clone()).unwrap())
            .collect();

        // One server request for the four callers.
        assert_eq!(fixture.client.subscribe_requests().len(), 1);

        let sid = server_id(&fixture);
        fixture
            .manager
            .handle_shape_data(&sid, &[initial_change(1)])
            .unwrap();

        assert_eq!(fixture.manager.active_count(), 1);
        for rx in receivers {
            rx.try_recv().unwrap().unwrap();
        }
    }

    #[test]
    fn subscribe_on_active_key_with_same_shapes_is_immediate() {
        let fixture = fixture();
        let shapes = vec![ShapeDef::table("parent")];

        fixture.manager.subscribe("key-1", shapes.clone()).unwrap();
        let sid = server_id(&fixture);
        fixture
            .manager
            .handle_shape_data(&sid, &[initial_change(1)])
            .unwrap();

        let rx = fixture.manager.subscribe("key-1", shapes).unwrap();
        rx.try_recv().unwrap().unwrap();
        assert_eq!(fixture.client.subscribe_requests().len(), 1);
    }

    #[test]
    fn shape_change_replaces_and_removes_uncovered_rows() {
        let fixture = fixture();

        fixture
            .manager
            .subscribe("key-1", vec![ShapeDef::table("parent")])
            .unwrap();
        let old_sid = server_id(&fixture);
        fixture
            .manager
            .handle_shape_data(&old_sid, &[initial_change(1), initial_change(2)])
            .unwrap();

        // Replace with a narrower shape on the same key.
        let narrowed = vec![ShapeDef {
            tablename: "parent".into(),
            where_clause: Some("id = 1".into()),
        }];
        fixture.manager.subscribe("key-1", narrowed).unwrap();
        let new_sid = server_id(&fixture);
        assert_ne!(new_sid, old_sid);

        fixture
            .manager
            .handle_shape_data(&new_sid, &[initial_change(1)])
            .unwrap();

        // Row 2 belonged only to the old shape and was removed.
        let rows = fixture
            .store
            .adapter()
            .query(&Statement::simple("SELECT id FROM parent ORDER BY id"))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], SqlValue::from(1i64));
        assert!(fixture
            .store
            .get_shadow(&parent_table(), r#"{"id":2}"#)
            .unwrap()
            .is_none());
        assert_eq!(fixture.manager.status("key-1"), Some(SubscriptionStatus::Active));
    }

    #[test]
    fn stale_delivery_for_replaced_attempt_is_discarded() {
        let fixture = fixture();

        fixture
            .manager
            .subscribe("key-1", vec![ShapeDef::table("parent")])
            .unwrap();
        let old_sid = server_id(&fixture);

        // Replace before any data arrives.
        fixture
            .manager
            .subscribe(
                "key-1",
                vec![ShapeDef {
                    tablename: "parent".into(),
                    where_clause: Some("id = 1".into()),
                }],
            )
            .unwrap();

        // Data for the replaced attempt must not touch the database.
        fixture
            .manager
            .handle_shape_data(&old_sid, &[initial_change(9)])
            .unwrap();
        let rows = fixture
            .store
            .adapter()
            .query(&Statement::simple("SELECT id FROM parent"))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn delivery_failure_resets_all_shape_state() {
        let fixture = fixture();

        // A successful subscription first.
        fixture
            .manager
            .subscribe("key-1", vec![ShapeDef::table("parent")])
            .unwrap();
        let sid = server_id(&fixture);
        fixture
            .manager
            .handle_shape_data(&sid, &[initial_change(1)])
            .unwrap();

        // Then one that references an unknown table.
        let rx = fixture
            .manager
            .subscribe("key-2", vec![ShapeDef::table("another")])
            .unwrap();
        let sid2 = server_id(&fixture);
        let mut row = Row::new();
        row.insert("id".into(), SqlValue::from(1i64));
        fixture
            .manager
            .handle_shape_data(
                &sid2,
                &[DataChange::initial(
                    QualifiedTablename::new("main", "another"),
                    row,
                    vec![],
                )],
            )
            .unwrap();

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind(), satellite_core::ErrorKind::ShapeDeliveryError);

        // active, known, unfulfilled, and unsubscribes are all empty again.
        assert!(fixture.manager.is_empty().unwrap());
    }

    #[test]
    fn rejected_subscribe_surfaces_server_error() {
        let fixture = fixture();
        fixture
            .client
            .fail_next_subscribe(SatelliteError::subscription_already_exists("key-1"));

        let rx = fixture
            .manager
            .subscribe("key-1", vec![ShapeDef::table("parent")])
            .unwrap();

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(
            err.kind(),
            satellite_core::ErrorKind::SubscriptionAlreadyExists
        );
        assert!(fixture.manager.is_empty().unwrap());
    }

    #[test]
    fn unsubscribe_removes_covered_rows_and_record() {
        let fixture = fixture();

        fixture
            .manager
            .subscribe("key-1", vec![ShapeDef::table("parent")])
            .unwrap();
        let sid = server_id(&fixture);
        fixture
            .manager
            .handle_shape_data(&sid, &[initial_change(1)])
            .unwrap();

        fixture.manager.unsubscribe(&["key-1"]).unwrap();

        assert_eq!(fixture.manager.status("key-1"), None);
        assert_eq!(fixture.client.unsubscribe_requests().len(), 1);
        let rows = fixture
            .store
            .adapter()
            .query(&Statement::simple("SELECT id FROM parent"))
            .unwrap();
        assert!(rows.is_empty());
        assert!(fixture.manager.is_empty().unwrap());
    }

    #[test]
    fn persisted_state_survives_restart() {
        let fixture = fixture();

        fixture
            .manager
            .subscribe("key-1", vec![ShapeDef::table("parent")])
            .unwrap();
        let sid = server_id(&fixture);
        fixture
            .manager
            .handle_shape_data(&sid, &[initial_change(1)])
            .unwrap();

        // A second manager over the same store restores the record.
        let notifier = Arc::new(Notifier::new());
        let apply = Arc::new(ApplyEngine::new(
            Arc::clone(&fixture.store),
            Arc::clone(&notifier),
            "client-a",
            relations(),
            FkChecks::Inherit,
            false,
        ));
        let restored = ShapeManager::new(
            Arc::clone(&fixture.store),
            apply,
            Arc::new(MockReplicationClient::new()),
            notifier,
        );
        restored.load().unwrap();

        assert_eq!(restored.status("key-1"), Some(SubscriptionStatus::Active));
        assert_eq!(restored.active_subscription_ids(), vec![sid]);
    }

    #[test]
    fn unfulfilled_subscriptions_retry_on_reconnect() {
        let fixture = fixture();

        fixture
            .manager
            .subscribe("key-1", vec![ShapeDef::table("parent")])
            .unwrap();
        assert_eq!(fixture.client.subscribe_requests().len(), 1);

        fixture.manager.retry_unfulfilled().unwrap();
        assert_eq!(fixture.client.subscribe_requests().len(), 2);
        let requests = fixture.client.subscribe_requests();
        assert_eq!(requests[0].subscription_id, requests[1].subscription_id);
    }
}
