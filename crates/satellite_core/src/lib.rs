//! # Satellite Core
//!
//! Pure data layer for the Satellite replication client.
//!
//! This crate provides:
//! - Causal tag algebra (`origin@timestamp` tags and tag sets)
//! - The SQL value model preserving blobs and 64-bit integers
//! - Oplog and shadow-row data model
//! - The pure merge engine (column-level last-writer-wins with tag union)
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod merge;
pub mod oplog;
pub mod tags;
pub mod types;

pub use error::{ErrorKind, SatelliteError, SatelliteResult};
pub use merge::{merge_entries, MergedChanges, ResolvedRow, TimestampedValue};
pub use oplog::{OpType, OplogEntry, ShadowEntry};
pub use tags::{Tag, TagSet, SERVER_ORIGIN};
pub use types::{
    ForeignKey, QualifiedTablename, Relation, RelationColumn, Relations, Row, SqlValue,
};
