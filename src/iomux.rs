//! # I/O Request Multiplexer
//!
//! Correlates outbound requests with inbound responses by I/O-ID (spec.md
//! §4.5). A single `IoMux` is owned by the `Context`; a `Transport`'s
//! receive loop completes outstanding requests by I/O-ID when a matching
//! response frame arrives. `putNoWait` bypasses this entirely (spec.md
//! §4.5) and is not represented here at all.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::codec::Bundle;
use crate::error::Status;
use crate::utils::{now_unix_millis, IdGenerator};

/// What kind of outbound operation a `Request` correlates, per spec.md §3's
/// Request attributes. CREATE_CHANNEL and subscribe/unsubscribe are not
/// represented here: they're routed through `TransportSink` instead of the
/// mux, since they aren't one-shot request/response pairs (subscriptions
/// recur, CREATE_CHANNEL can race a channel being closed mid-flight).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    ReadNotify,
    WriteNotify,
}

/// What an outstanding request resolves to on completion.
#[derive(Debug)]
pub enum RequestOutcome {
    /// A READ_NOTIFY response body.
    Value(Bundle),
    /// A WRITE_NOTIFY acknowledgement carrying only a status.
    Ack(Status),
}

struct Entry {
    kind: RequestKind,
    channel_id: u32,
    transport_key: u64,
    created_at_ms: u64,
    completion: oneshot::Sender<Result<RequestOutcome, Status>>,
}

/// Tracks outstanding requests by I/O-ID, owned by the `Context`.
pub struct IoMux {
    ids: IdGenerator,
    table: Mutex<HashMap<u32, Entry>>,
}

impl IoMux {
    pub fn new() -> Self {
        Self {
            ids: IdGenerator::new(),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new outbound request, returning its fresh I/O-ID and the
    /// receiving half of its completion channel. Uniqueness is maintained
    /// by occupancy, not by the counter alone, so a wrapped id that
    /// collides with one still in flight is skipped (spec.md §4.5).
    pub fn register(
        &self,
        kind: RequestKind,
        channel_id: u32,
        transport_key: u64,
    ) -> (u32, oneshot::Receiver<Result<RequestOutcome, Status>>) {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();
        loop {
            let id = self.ids.next();
            if let std::collections::hash_map::Entry::Vacant(slot) = table.entry(id) {
                slot.insert(Entry {
                    kind,
                    channel_id,
                    transport_key,
                    created_at_ms: now_unix_millis(),
                    completion: tx,
                });
                return (id, rx);
            }
        }
    }

    /// Complete a request by I/O-ID. Returns `false` if the I/O-ID is
    /// unknown (already completed, cancelled, or never issued); the caller
    /// logs and discards per spec.md §4.5.
    pub fn complete(&self, io_id: u32, outcome: Result<RequestOutcome, Status>) -> bool {
        let entry = self.table.lock().remove(&io_id);
        match entry {
            Some(entry) => {
                tracing::debug!(
                    io_id,
                    kind = ?entry.kind,
                    age_ms = now_unix_millis().saturating_sub(entry.created_at_ms),
                    "request completed"
                );
                let _ = entry.completion.send(outcome);
                true
            }
            None => {
                tracing::warn!(io_id, "response for unknown I/O-ID discarded");
                false
            }
        }
    }

    /// Fail every outstanding request for a channel (explicit close or
    /// DISCONNECTED transition).
    pub fn cancel_channel(&self, channel_id: u32, status: Status) {
        let mut table = self.table.lock();
        let dead: Vec<u32> = table
            .iter()
            .filter(|(_, e)| e.channel_id == channel_id)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(entry) = table.remove(&id) {
                tracing::debug!(
                    io_id = id,
                    age_ms = now_unix_millis().saturating_sub(entry.created_at_ms),
                    "request cancelled with its channel"
                );
                let _ = entry.completion.send(Err(status.clone()));
            }
        }
    }

    /// Fail every outstanding request hosted on a dead transport.
    pub fn cancel_transport(&self, transport_key: u64, status: Status) {
        let mut table = self.table.lock();
        let dead: Vec<u32> = table
            .iter()
            .filter(|(_, e)| e.transport_key == transport_key)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(entry) = table.remove(&id) {
                tracing::debug!(
                    io_id = id,
                    age_ms = now_unix_millis().saturating_sub(entry.created_at_ms),
                    "request cancelled with its transport"
                );
                let _ = entry.completion.send(Err(status.clone()));
            }
        }
    }

    /// Remove a request without completing it (caller dropped its future).
    pub fn cancel(&self, io_id: u32) {
        self.table.lock().remove(&io_id);
    }

    pub fn kind_of(&self, io_id: u32) -> Option<RequestKind> {
        self.table.lock().get(&io_id).map(|e| e.kind)
    }

    pub fn outstanding_count(&self) -> usize {
        self.table.lock().len()
    }
}

impl Default for IoMux {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_delivers_to_registrant() {
        let mux = IoMux::new();
        let (id, rx) = mux.register(RequestKind::ReadNotify, 1, 100);
        assert!(mux.complete(
            id,
            Ok(RequestOutcome::Value(Bundle {
                meta: crate::codec::Metadata::Plain,
                value: crate::codec::Value::Int(vec![7]),
            }))
        ));
        let outcome = rx.await.unwrap().unwrap();
        match outcome {
            RequestOutcome::Value(b) => assert_eq!(b.value, crate::codec::Value::Int(vec![7])),
            _ => panic!("wrong outcome"),
        }
    }

    #[test]
    fn unknown_io_id_is_reported_false() {
        let mux = IoMux::new();
        assert!(!mux.complete(9999, Err(Status::Disconn)));
    }

    #[tokio::test]
    async fn cancel_channel_fails_only_its_own_requests() {
        let mux = IoMux::new();
        let (_id_a, rx_a) = mux.register(RequestKind::ReadNotify, 1, 100);
        let (_id_b, rx_b) = mux.register(RequestKind::ReadNotify, 2, 100);
        mux.cancel_channel(1, Status::ChanDestroy);
        assert_eq!(rx_a.await.unwrap().unwrap_err(), Status::ChanDestroy);
        assert_eq!(mux.outstanding_count(), 1);
        drop(rx_b);
    }

    #[tokio::test]
    async fn cancel_transport_fails_all_hosted_requests() {
        let mux = IoMux::new();
        let (_id_a, rx_a) = mux.register(RequestKind::Write, 1, 100);
        let (_id_b, rx_b) = mux.register(RequestKind::Write, 2, 100);
        mux.cancel_transport(100, Status::Disconn);
        assert_eq!(rx_a.await.unwrap().unwrap_err(), Status::Disconn);
        assert_eq!(rx_b.await.unwrap().unwrap_err(), Status::Disconn);
        assert_eq!(mux.outstanding_count(), 0);
    }

    #[test]
    fn register_assigns_distinct_ids() {
        let mux = IoMux::new();
        let (a, _) = mux.register(RequestKind::Read, 1, 1);
        let (b, _) = mux.register(RequestKind::Read, 1, 1);
        assert_ne!(a, b);
    }
}
