//! Replication client seam.
//!
//! Abstracts the wire protocol so the engine can be driven against real
//! servers or a scripted mock. The codec and socket handling live behind
//! this trait.

use parking_lot::Mutex;
use satellite_core::{SatelliteError, SatelliteResult};
use satellite_proto::{
    DataTransaction, ReplicationMessage, SubscribeRequest, SubscribeResponse, UnsubscribeRequest,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Network operations the engine needs from the replication protocol.
pub trait ReplicationClient {
    /// Opens the replication stream, resuming from `lsn` and re-attaching
    /// the given shape subscriptions.
    fn start_replication(
        &self,
        lsn: Option<Vec<u8>>,
        subscription_ids: &[String],
    ) -> SatelliteResult<()>;

    /// Closes the replication stream.
    fn stop_replication(&self) -> SatelliteResult<()>;

    /// Sends a locally committed transaction upstream.
    fn send_transaction(&self, tx: &DataTransaction) -> SatelliteResult<()>;

    /// Requests a shape subscription.
    fn subscribe(&self, request: &SubscribeRequest) -> SatelliteResult<SubscribeResponse>;

    /// Cancels shape subscriptions.
    fn unsubscribe(&self, request: &UnsubscribeRequest) -> SatelliteResult<()>;

    /// Returns the next inbound message, if one is waiting.
    fn poll_message(&self) -> SatelliteResult<Option<ReplicationMessage>>;

    /// Returns true while the stream is open.
    fn is_connected(&self) -> bool;
}

/// A scripted replication client for tests.
#[derive(Default)]
pub struct MockReplicationClient {
    connected: AtomicBool,
    start_error: Mutex<Option<SatelliteError>>,
    subscribe_error: Mutex<Option<SatelliteError>>,
    inbound: Mutex<VecDeque<ReplicationMessage>>,
    sent_transactions: Mutex<Vec<DataTransaction>>,
    subscribe_requests: Mutex<Vec<SubscribeRequest>>,
    unsubscribe_requests: Mutex<Vec<UnsubscribeRequest>>,
    start_calls: Mutex<Vec<Vec<String>>>,
}

impl MockReplicationClient {
    /// Creates a mock client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next `start_replication` call to fail.
    pub fn fail_next_start(&self, error: SatelliteError) {
        *self.start_error.lock() = Some(error);
    }

    /// Scripts the next `subscribe` call to fail.
    pub fn fail_next_subscribe(&self, error: SatelliteError) {
        *self.subscribe_error.lock() = Some(error);
    }

    /// Queues an inbound message.
    pub fn push_message(&self, message: ReplicationMessage) {
        self.inbound.lock().push_back(message);
    }

    /// Returns the transactions sent upstream.
    pub fn sent_transactions(&self) -> Vec<DataTransaction> {
        self.sent_transactions.lock().clone()
    }

    /// Returns the subscribe requests issued so far.
    pub fn subscribe_requests(&self) -> Vec<SubscribeRequest> {
        self.subscribe_requests.lock().clone()
    }

    /// Returns the unsubscribe requests issued so far.
    pub fn unsubscribe_requests(&self) -> Vec<UnsubscribeRequest> {
        self.unsubscribe_requests.lock().clone()
    }

    /// Returns the subscription ids passed to each `start_replication`.
    pub fn start_calls(&self) -> Vec<Vec<String>> {
        self.start_calls.lock().clone()
    }
}

impl ReplicationClient for MockReplicationClient {
    fn start_replication(
        &self,
        _lsn: Option<Vec<u8>>,
        subscription_ids: &[String],
    ) -> SatelliteResult<()> {
        if let Some(error) = self.start_error.lock().take() {
            return Err(error);
        }
        self.start_calls.lock().push(subscription_ids.to_vec());
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_replication(&self) -> SatelliteResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send_transaction(&self, tx: &DataTransaction) -> SatelliteResult<()> {
        self.sent_transactions.lock().push(tx.clone());
        Ok(())
    }

    fn subscribe(&self, request: &SubscribeRequest) -> SatelliteResult<SubscribeResponse> {
        if let Some(error) = self.subscribe_error.lock().take() {
            return Err(error);
        }
        self.subscribe_requests.lock().push(request.clone());
        Ok(SubscribeResponse {
            subscription_id: request.subscription_id.clone(),
            error: None,
        })
    }

    fn unsubscribe(&self, request: &UnsubscribeRequest) -> SatelliteResult<()> {
        self.unsubscribe_requests.lock().push(request.clone());
        Ok(())
    }

    fn poll_message(&self) -> SatelliteResult<Option<ReplicationMessage>> {
        Ok(self.inbound.lock().pop_front())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
