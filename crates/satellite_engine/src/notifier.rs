//! Notifier bus.
//!
//! Fans engine events out to host subscribers over plain channels. The
//! notifier is a pure message bus: it holds no reference back into the
//! engine, and emitting never blocks. Subscribers that dropped their
//! receiver are pruned on the next emit.

use parking_lot::RwLock;
use satellite_core::QualifiedTablename;
use std::sync::mpsc::{self, Receiver, Sender};

/// Changes to one table from a snapshot or apply.
#[derive(Debug, Clone, PartialEq)]
pub struct TableChange {
    /// The affected table.
    pub table: QualifiedTablename,
    /// Oplog rowids of the contributing entries, when known.
    pub rowids: Vec<i64>,
    /// Number of record changes applied to the table.
    pub record_changes: usize,
}

/// Notification that user tables changed.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChangeNotification {
    /// Origin of the writes (`local` snapshots carry the client id).
    pub origin: String,
    /// Per-table change summaries.
    pub changes: Vec<TableChange>,
}

/// Connection lifecycle status reported to hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityStatus {
    /// The engine is stopped.
    Stopped,
    /// The engine is loading persisted state.
    Initializing,
    /// A connection attempt is in flight.
    Connecting,
    /// The replication stream is up.
    Connected,
    /// The stream is down.
    Disconnected,
}

/// Notification of a connectivity state change.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityNotification {
    /// The logical database this engine manages.
    pub db_name: String,
    /// The new status.
    pub status: ConnectivityStatus,
    /// Why the state changed, for disconnects.
    pub reason: Option<String>,
}

/// Notification of a shape subscription status change.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeStateNotification {
    /// The caller-supplied subscription key.
    pub key: String,
    /// The new status as a stable string (`establishing`, `active`,
    /// `cancelling`, `gone`).
    pub status: String,
}

/// Fan-out bus for engine events.
#[derive(Default)]
pub struct Notifier {
    data_subscribers: RwLock<Vec<Sender<DataChangeNotification>>>,
    connectivity_subscribers: RwLock<Vec<Sender<ConnectivityNotification>>>,
    shape_subscribers: RwLock<Vec<Sender<ShapeStateNotification>>>,
}

impl Notifier {
    /// Creates an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to data change notifications.
    pub fn subscribe_to_data_changes(&self) -> Receiver<DataChangeNotification> {
        let (tx, rx) = mpsc::channel();
        self.data_subscribers.write().push(tx);
        rx
    }

    /// Subscribes to connectivity state changes.
    pub fn subscribe_to_connectivity_state_changes(&self) -> Receiver<ConnectivityNotification> {
        let (tx, rx) = mpsc::channel();
        self.connectivity_subscribers.write().push(tx);
        rx
    }

    /// Subscribes to shape subscription state changes.
    pub fn subscribe_to_shape_state_changes(&self) -> Receiver<ShapeStateNotification> {
        let (tx, rx) = mpsc::channel();
        self.shape_subscribers.write().push(tx);
        rx
    }

    /// Emits a data change notification.
    pub fn emit_data_changes(&self, notification: DataChangeNotification) {
        let mut subscribers = self.data_subscribers.write();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Emits a connectivity notification.
    pub fn emit_connectivity(&self, notification: ConnectivityNotification) {
        let mut subscribers = self.connectivity_subscribers.write();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Emits a shape state notification.
    pub fn emit_shape_state(&self, notification: ShapeStateNotification) {
        let mut subscribers = self.shape_subscribers.write();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_changes_reach_all_subscribers() {
        let notifier = Notifier::new();
        let rx1 = notifier.subscribe_to_data_changes();
        let rx2 = notifier.subscribe_to_data_changes();

        let notification = DataChangeNotification {
            origin: "client-a".into(),
            changes: vec![TableChange {
                table: QualifiedTablename::new("main", "parent"),
                rowids: vec![1, 2],
                record_changes: 2,
            }],
        };
        notifier.emit_data_changes(notification.clone());

        assert_eq!(rx1.try_recv().unwrap(), notification);
        assert_eq!(rx2.try_recv().unwrap(), notification);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe_to_connectivity_state_changes();
        drop(rx);

        notifier.emit_connectivity(ConnectivityNotification {
            db_name: "test.db".into(),
            status: ConnectivityStatus::Connected,
            reason: None,
        });
        assert!(notifier.connectivity_subscribers.read().is_empty());
    }

    #[test]
    fn connectivity_carries_reason() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe_to_connectivity_state_changes();

        notifier.emit_connectivity(ConnectivityNotification {
            db_name: "test.db".into(),
            status: ConnectivityStatus::Disconnected,
            reason: Some("AUTH_EXPIRED".into()),
        });

        let got = rx.try_recv().unwrap();
        assert_eq!(got.status, ConnectivityStatus::Disconnected);
        assert_eq!(got.reason.as_deref(), Some("AUTH_EXPIRED"));
    }
}
