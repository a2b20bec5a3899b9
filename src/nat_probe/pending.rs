/**
 * nat_probe/pending.rs
 *
 * Outstanding Binding Requests keyed by transaction id
 */

use crate::nat_probe::stun::{StunHeader, TransactionId};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

/// A request that is still waiting for its response
#[derive(Debug, Clone, Copy)]
pub struct PendingRequest {
    pub server: SocketAddrV4,
    pub sent_at: Instant,
}

/// Table of outstanding requests.
///
/// A response is accepted only when its transaction id was registered
/// here and has not been claimed, cancelled or expired since.
#[derive(Debug, Default)]
pub struct PendingTransactions {
    pending: HashMap<TransactionId, PendingRequest>,
}

impl PendingTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. Must happen before the datagram is sent.
    pub fn register(&mut self, transaction_id: TransactionId, server: SocketAddrV4) {
        self.pending.insert(
            transaction_id,
            PendingRequest {
                server,
                sent_at: Instant::now(),
            },
        );
    }

    /// Claim the request a datagram answers, if any
    pub fn claim(&mut self, datagram: &[u8]) -> Option<(TransactionId, PendingRequest)> {
        let header = StunHeader::parse(datagram)?;
        self.pending
            .remove(&header.transaction_id)
            .map(|request| (header.transaction_id, request))
    }

    pub fn cancel(&mut self, transaction_id: &TransactionId) -> Option<PendingRequest> {
        self.pending.remove(transaction_id)
    }

    /// Drop requests sent more than `timeout` ago and return their ids
    pub fn expire(&mut self, timeout: Duration) -> Vec<(TransactionId, PendingRequest)> {
        let expired: Vec<TransactionId> = self
            .pending
            .iter()
            .filter(|(_, request)| request.sent_at.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|request| (id, request)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat_probe::stun::{encode_binding_response, BindingRequest};

    fn server() -> SocketAddrV4 {
        "192.0.2.10:3478".parse().unwrap()
    }

    #[test]
    fn claims_matching_response_once() {
        let mut pending = PendingTransactions::new();
        let request = BindingRequest::new();
        pending.register(request.transaction_id, server());

        let response = encode_binding_response(&request.transaction_id, &[]);
        let (id, claimed) = pending.claim(&response).unwrap();
        assert_eq!(id, request.transaction_id);
        assert_eq!(claimed.server, server());

        // A duplicate of the same response is stale
        assert!(pending.claim(&response).is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn rejects_unknown_transaction() {
        let mut pending = PendingTransactions::new();
        pending.register(BindingRequest::new().transaction_id, server());

        let spoofed = encode_binding_response(&TransactionId::from_bytes([1u8; 12]), &[]);
        assert!(pending.claim(&spoofed).is_none());
        assert!(pending.claim(b"short").is_none());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn cancelled_request_no_longer_matches() {
        let mut pending = PendingTransactions::new();
        let request = BindingRequest::new();
        pending.register(request.transaction_id, server());
        assert!(pending.cancel(&request.transaction_id).is_some());

        let late = encode_binding_response(&request.transaction_id, &[]);
        assert!(pending.claim(&late).is_none());
    }

    #[test]
    fn expires_old_requests() {
        let mut pending = PendingTransactions::new();
        let request = BindingRequest::new();
        pending.register(request.transaction_id, server());

        assert!(pending.expire(Duration::from_secs(60)).is_empty());

        let expired = pending.expire(Duration::ZERO);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, request.transaction_id);
        assert!(pending.is_empty());
    }
}
