//! Connection controller.
//!
//! Owns the replication client for the lifetime of a session and ties the
//! other engines together: it drives the snapshot timer, flushes snapshotted
//! entries upstream, applies inbound messages strictly in stream order, and
//! classifies errors (backoff-retry, BEHIND_WINDOW reset, auth expiry).
//!
//! Lifecycle: `stopped → initializing → connecting → connected ↔
//! disconnected → stopped`. Every transition emits a connectivity
//! notification carrying the database name.

use crate::adapter::DbAdapter;
use crate::apply::ApplyEngine;
use crate::auth::TokenClaims;
use crate::client::ReplicationClient;
use crate::config::SatelliteConfig;
use crate::notifier::{ConnectivityNotification, ConnectivityStatus, Notifier};
use crate::shapes::ShapeManager;
use crate::snapshot::{now_millis, SnapshotEngine};
use crate::store::OplogStore;
use parking_lot::RwLock;
use satellite_core::{
    ErrorKind, OpType, OplogEntry, SatelliteError, SatelliteResult, Tag, SERVER_ORIGIN,
};
use satellite_proto::{ChangeType, DataChange, DataTransaction, ReplicationMessage};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of the connection controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started.
    Stopped,
    /// Loading persisted state.
    Initializing,
    /// A connect attempt is in flight.
    Connecting,
    /// The replication stream is up.
    Connected,
    /// Started but not connected.
    Disconnected,
}

impl ConnectionState {
    fn connectivity(&self) -> ConnectivityStatus {
        match self {
            ConnectionState::Stopped => ConnectivityStatus::Stopped,
            ConnectionState::Initializing => ConnectivityStatus::Initializing,
            ConnectionState::Connecting => ConnectivityStatus::Connecting,
            ConnectionState::Connected => ConnectivityStatus::Connected,
            ConnectionState::Disconnected => ConnectivityStatus::Disconnected,
        }
    }
}

/// Ties the engines together and manages the replication connection.
pub struct ConnectionController<A: DbAdapter, C: ReplicationClient> {
    config: SatelliteConfig,
    store: Arc<OplogStore<A>>,
    client: Arc<C>,
    apply: Arc<ApplyEngine<A>>,
    snapshot: Arc<SnapshotEngine<A>>,
    shapes: Arc<ShapeManager<A, C>>,
    notifier: Arc<Notifier>,
    state: RwLock<ConnectionState>,
    client_id: RwLock<Option<String>>,
    bound_user: RwLock<Option<String>>,
    cancelled: AtomicBool,
    sent_cursor: AtomicI64,
}

impl<A: DbAdapter, C: ReplicationClient> ConnectionController<A, C> {
    /// Creates a controller over the assembled engines.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SatelliteConfig,
        store: Arc<OplogStore<A>>,
        client: Arc<C>,
        apply: Arc<ApplyEngine<A>>,
        snapshot: Arc<SnapshotEngine<A>>,
        shapes: Arc<ShapeManager<A, C>>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            client,
            apply,
            snapshot,
            shapes,
            notifier,
            state: RwLock::new(ConnectionState::Stopped),
            client_id: RwLock::new(None),
            bound_user: RwLock::new(None),
            cancelled: AtomicBool::new(false),
            sent_cursor: AtomicI64::new(0),
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Returns the client id once started.
    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    /// Loads or creates the client identity and restores persisted state.
    ///
    /// Fails if the provided token's user disagrees with an identity bound
    /// earlier in this session.
    pub fn start(&self, token: Option<&str>) -> SatelliteResult<String> {
        self.set_state(ConnectionState::Initializing, None);

        self.store.ensure_tables()?;

        if let Some(token) = token {
            let claims = TokenClaims::parse(token)?;
            self.bind_user(claims.user_id)?;
        }

        let client_id = match self.store.client_id()? {
            Some(existing) => existing,
            None => {
                let fresh = Uuid::new_v4().to_string();
                self.store.set_client_id(&fresh)?;
                fresh
            }
        };
        *self.client_id.write() = Some(client_id.clone());

        self.store.set_compensations(self.config.compensations)?;
        self.shapes.load()?;
        info!(%client_id, "satellite started");

        self.set_state(ConnectionState::Disconnected, None);
        Ok(client_id)
    }

    /// Replaces the auth token.
    ///
    /// Permitted while connected. Fails if the token carries no identity or
    /// an identity different from the currently bound one.
    pub fn set_token(&self, token: &str) -> SatelliteResult<()> {
        let claims = TokenClaims::parse(token)?;
        self.bind_user(claims.user_id)
    }

    fn bind_user(&self, user_id: String) -> SatelliteResult<()> {
        let mut bound = self.bound_user.write();
        match bound.as_ref() {
            Some(existing) if *existing != user_id => Err(SatelliteError::auth_required(
                format!("token user {user_id} does not match bound identity {existing}"),
            )),
            _ => {
                *bound = Some(user_id);
                Ok(())
            }
        }
    }

    /// Connects with retries governed by `retry`.
    ///
    /// `retry(error, attempt)` decides whether a failed attempt is retried.
    /// A `disconnect()` issued while an attempt or its backoff sleep is
    /// pending fails the call with `CONNECTION_CANCELLED_BY_DISCONNECT`.
    pub fn connect_with_backoff(
        &self,
        retry: impl Fn(&SatelliteError, u32) -> bool,
    ) -> SatelliteResult<()> {
        if self.client_id().is_none() {
            return Err(SatelliteError::internal("connect before start"));
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let mut attempt: u32 = 0;
        loop {
            self.check_cancelled()?;
            self.set_state(ConnectionState::Connecting, None);

            match self.connect_once() {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected, None);
                    return Ok(());
                }
                Err(error) => match error.kind() {
                    ErrorKind::BehindWindow => {
                        // Mandatory local reset, then try again right away.
                        self.handle_behind_window()?;
                    }
                    ErrorKind::AuthExpired => {
                        self.set_state(
                            ConnectionState::Disconnected,
                            Some("AUTH_EXPIRED".into()),
                        );
                        return Err(error);
                    }
                    _ => {
                        if !retry(&error, attempt) {
                            self.set_state(
                                ConnectionState::Disconnected,
                                Some(error.to_string()),
                            );
                            return Err(error);
                        }
                        warn!(attempt, %error, "connect attempt failed, backing off");
                        self.sleep_cancellable(
                            self.config.backoff.delay_for_attempt(attempt + 1),
                        )?;
                    }
                },
            }
            attempt += 1;
        }
    }

    fn connect_once(&self) -> SatelliteResult<()> {
        let lsn = self.store.lsn()?;
        let subscription_ids = self.shapes.active_subscription_ids();
        self.client.start_replication(lsn, &subscription_ids)?;
        self.shapes.retry_unfulfilled()?;
        Ok(())
    }

    /// Stops the outbound stream, clears shape-stream subscriptions, and
    /// fails pending connects.
    ///
    /// Local oplog entries are kept; they are re-sent after the next
    /// connect.
    pub fn disconnect(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Err(error) = self.client.stop_replication() {
            debug!(%error, "stop_replication during disconnect");
        }
        if let Err(error) = self.shapes.reset_all() {
            debug!(%error, "clearing shape subscriptions during disconnect");
        }
        self.set_state(ConnectionState::Disconnected, None);
    }

    /// Disconnects and halts all timers.
    pub fn stop(&self) {
        self.disconnect();
        self.set_state(ConnectionState::Stopped, None);
    }

    /// Drives the engine: snapshots on the polling cadence, flushes new
    /// entries upstream, and applies inbound messages in order.
    ///
    /// Snapshots run whenever the engine is started, connected or not; a
    /// stopped engine schedules nothing.
    pub fn tick(&self, now: Instant) -> SatelliteResult<()> {
        match self.state() {
            ConnectionState::Stopped => return Ok(()),
            ConnectionState::Initializing => return Ok(()),
            _ => {}
        }

        if let Some(outcome) = self.snapshot.tick(now)? {
            if !outcome.is_empty() && self.state() == ConnectionState::Connected {
                self.flush_outbound()?;
            }
        }

        if self.state() == ConnectionState::Connected {
            self.process_inbound()?;
        }
        Ok(())
    }

    /// Marks the database as potentially changed; the next tick snapshots
    /// after the coalescing window.
    pub fn potentially_changed(&self) {
        self.snapshot.request_snapshot();
    }

    /// Sends snapshotted oplog entries that have not been sent yet,
    /// grouped per snapshot timestamp.
    pub fn flush_outbound(&self) -> SatelliteResult<()> {
        let Some(client_id) = self.client_id() else {
            return Ok(());
        };
        let cursor = self.sent_cursor.load(Ordering::SeqCst);
        let entries = self.store.entries_since(Some(cursor))?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut batch: Vec<OplogEntry> = Vec::new();
        let mut batch_ts: Option<i64> = None;
        let mut max_rowid = cursor;

        let flush_batch =
            |batch: &mut Vec<OplogEntry>, ts: i64| -> SatelliteResult<()> {
                let changes: Vec<DataChange> = batch
                    .iter()
                    .map(|e| entry_to_change(e, &client_id))
                    .collect::<SatelliteResult<_>>()?;
                self.client.send_transaction(&DataTransaction {
                    lsn: Vec::new(),
                    commit_timestamp: ts,
                    origin: client_id.clone(),
                    changes,
                })?;
                batch.clear();
                Ok(())
            };

        for entry in entries {
            max_rowid = max_rowid.max(entry.rowid);
            let ts = entry.timestamp.ok_or_else(|| {
                SatelliteError::internal("unstamped entry in outbound stream")
            })?;
            if batch_ts.is_some() && batch_ts != Some(ts) {
                flush_batch(&mut batch, batch_ts.unwrap_or(ts))?;
            }
            batch_ts = Some(ts);
            batch.push(entry);
        }
        if let Some(ts) = batch_ts {
            if !batch.is_empty() {
                flush_batch(&mut batch, ts)?;
            }
        }

        self.sent_cursor.store(max_rowid, Ordering::SeqCst);
        Ok(())
    }

    /// Applies every waiting inbound message, strictly in stream order.
    pub fn process_inbound(&self) -> SatelliteResult<usize> {
        let mut processed = 0;
        while let Some(message) = self.client.poll_message()? {
            self.handle_message(message)?;
            processed += 1;
        }
        Ok(processed)
    }

    fn handle_message(&self, message: ReplicationMessage) -> SatelliteResult<()> {
        match message {
            ReplicationMessage::Transaction(tx) => self.apply.apply_transaction(&tx),
            ReplicationMessage::AdditionalData(data) => {
                self.apply
                    .apply_additional_data(SERVER_ORIGIN, now_millis(), &data.changes)
            }
            ReplicationMessage::GoneBatch(batch) => {
                self.apply.apply_gone_batch(&batch, now_millis())
            }
            ReplicationMessage::ShapeData {
                subscription_id,
                changes,
            } => self.shapes.handle_shape_data(&subscription_id, &changes),
            ReplicationMessage::SubscribeDelivered(response) => {
                if let Some(error) = response.error {
                    warn!(subscription_id = %response.subscription_id, ?error,
                        "server rejected subscription");
                }
                Ok(())
            }
            ReplicationMessage::Error(code) => {
                let error = server_error(code);
                match error.kind() {
                    ErrorKind::BehindWindow => {
                        self.handle_behind_window()?;
                        Err(error)
                    }
                    ErrorKind::AuthExpired => {
                        self.set_state(
                            ConnectionState::Disconnected,
                            Some("AUTH_EXPIRED".into()),
                        );
                        Err(error)
                    }
                    _ => {
                        self.disconnect();
                        Err(error)
                    }
                }
            }
        }
    }

    /// Clears every replicated row (meta tables survive), resets the LSN,
    /// and re-subscribes all active shapes.
    fn handle_behind_window(&self) -> SatelliteResult<()> {
        warn!("behind server replication window, resetting local data");

        let relations = self.apply.relations().clone();
        self.store.adapter().transaction(|_| {
            let tables: Vec<&satellite_core::QualifiedTablename> = relations.keys().collect();
            let ordered = satellite_core::types::reverse_fk_order(&relations, &tables);
            for &table in &ordered {
                self.store.adapter().run(&crate::adapter::Statement::simple(format!(
                    "DELETE FROM {}",
                    self.store.builder().make_qt(table)
                )))?;
            }
            self.store.clear_shadow()?;
            self.store.clear_oplog()?;
            self.store.reset_lsn()?;
            Ok(())
        })?;

        self.sent_cursor.store(0, Ordering::SeqCst);
        self.shapes.resubscribe_active()
    }

    fn sleep_cancellable(&self, duration: Duration) -> SatelliteResult<()> {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.check_cancelled()?;
            std::thread::sleep(Duration::from_millis(10).min(duration));
        }
        self.check_cancelled()
    }

    fn check_cancelled(&self) -> SatelliteResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SatelliteError::ConnectionCancelledByDisconnect)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: ConnectionState, reason: Option<String>) {
        *self.state.write() = state;
        self.notifier.emit_connectivity(ConnectivityNotification {
            db_name: self.config.db_name.clone(),
            status: state.connectivity(),
            reason,
        });
    }
}

fn server_error(code: satellite_proto::ServerErrorCode) -> SatelliteError {
    use satellite_proto::ServerErrorCode;
    match code {
        ServerErrorCode::Internal => SatelliteError::internal("server error"),
        ServerErrorCode::AuthExpired => SatelliteError::auth_expired("server closed the stream"),
        ServerErrorCode::BehindWindow => SatelliteError::BehindWindow,
        ServerErrorCode::TableNotFound => SatelliteError::table_not_found("server relation"),
        ServerErrorCode::ShapeDeliveryError => {
            SatelliteError::shape_delivery("server aborted shape delivery")
        }
    }
}

/// Converts a snapshotted oplog entry to its outbound wire form.
fn entry_to_change(entry: &OplogEntry, client_id: &str) -> SatelliteResult<DataChange> {
    let timestamp = entry
        .timestamp
        .ok_or_else(|| SatelliteError::internal("unstamped entry in outbound stream"))?;
    let relation = entry.qualified_table();
    let new_tag = Tag::generate(client_id, timestamp).to_string();

    Ok(match entry.optype {
        OpType::Insert | OpType::Compensation => DataChange {
            relation,
            change_type: ChangeType::Insert,
            record: entry.new_row.clone(),
            old_record: None,
            tags: vec![new_tag],
        },
        OpType::Update | OpType::Upsert => DataChange {
            relation,
            change_type: ChangeType::Update,
            record: entry.new_row.clone(),
            old_record: entry.old_row.clone(),
            tags: vec![new_tag],
        },
        OpType::Delete => DataChange {
            relation,
            change_type: ChangeType::Delete,
            record: None,
            old_record: entry.old_row.clone(),
            tags: entry.decoded_clear_tags()?.to_wire(),
        },
        OpType::Gone => {
            return Err(SatelliteError::internal("local oplog contains GONE entry"))
        }
    })
}
