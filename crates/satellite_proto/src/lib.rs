//! # Satellite Protocol
//!
//! Replication wire-protocol data types for the Satellite client.
//!
//! This crate provides:
//! - `DataTransaction` and `DataChange` for the replication stream
//! - Shape subscription request/response messages
//! - Server error codes
//!
//! This is a pure data crate; the codec that frames these messages on the
//! wire is an external collaborator.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod messages;

pub use messages::{
    AdditionalData, ChangeType, DataChange, DataTransaction, GoneBatch, GoneRow,
    ReplicationMessage, ServerErrorCode, ShapeDef, SubscribeRequest, SubscribeResponse,
    UnsubscribeRequest,
};
