//! # Satellite Engine
//!
//! The on-device replication engine: oplog capture, snapshotting, merge and
//! apply of remote transactions, shape subscriptions, and the connection
//! lifecycle.
//!
//! This crate provides:
//! - `DbAdapter` seam with a SQLite implementation
//! - Oplog store over `_electric_oplog` / `_electric_shadow` / `_electric_meta`
//! - Snapshot engine draining trigger output under a serializing mutex
//! - Apply engine merging remote transactions into local tables
//! - Shape subscription state machine with garbage collection
//! - Connection controller with backoff, cancellation, and error routing
//!
//! # Concurrency
//!
//! The engine is single-threaded cooperative: entry points are synchronous
//! and suspension happens at database and network I/O. Multi-threaded hosts
//! wrap the engine in a single-owner actor. Timers are driven by `tick`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod apply;
pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod notifier;
pub mod shapes;
pub mod snapshot;
pub mod sqlite;
pub mod store;

pub use adapter::{DbAdapter, Dialect, QueryBuilder, Statement};
pub use apply::ApplyEngine;
pub use auth::TokenClaims;
pub use client::{MockReplicationClient, ReplicationClient};
pub use config::{BackoffConfig, FkChecks, SatelliteConfig};
pub use connection::{ConnectionController, ConnectionState};
pub use notifier::{
    ConnectivityNotification, ConnectivityStatus, DataChangeNotification, Notifier,
    ShapeStateNotification, TableChange,
};
pub use shapes::{Progress, ShapeManager, SubscriptionStatus, SyncedOutcome};
pub use snapshot::{SnapshotEngine, SnapshotOutcome};
pub use sqlite::SqliteAdapter;
pub use store::OplogStore;
