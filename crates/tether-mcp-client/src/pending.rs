//! In-flight request table
//!
//! Whoever removes an entry owns its completion sender, so every request is
//! resolved at most once no matter which path (response, timeout, teardown)
//! gets there first.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use tether_mcp_json_rpc::RequestId;

use crate::error::{McpClientError, McpClientResult};

pub(crate) type Completion = oneshot::Sender<McpClientResult<Value>>;

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub method: String,
    pub created_at: Instant,
    pub deadline: Instant,
    responder: Completion,
}

impl PendingRequest {
    /// Deliver the outcome; false when the caller already went away
    pub fn complete(self, outcome: McpClientResult<Value>) -> bool {
        self.responder.send(outcome).is_ok()
    }

    pub fn fail(self, error: McpClientError) -> bool {
        self.complete(Err(error))
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<RequestId, PendingRequest>,
}

impl PendingTable {
    /// Register a request; `None` if the id is already in flight
    pub fn insert(
        &mut self,
        id: RequestId,
        method: &str,
        created_at: Instant,
        deadline: Instant,
    ) -> Option<oneshot::Receiver<McpClientResult<Value>>> {
        if self.entries.contains_key(&id) {
            return None;
        }
        let (responder, receiver) = oneshot::channel();
        self.entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                created_at,
                deadline,
                responder,
            },
        );
        Some(receiver)
    }

    pub fn take(&mut self, id: &RequestId) -> Option<PendingRequest> {
        self.entries.remove(id)
    }

    pub fn drain(&mut self) -> Vec<(RequestId, PendingRequest)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn times() -> (Instant, Instant) {
        let now = Instant::now();
        (now, now + Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_refused() {
        let mut table = PendingTable::default();
        let (created, deadline) = times();

        assert!(table.insert(RequestId::Number(1), "ping", created, deadline).is_some());
        assert!(table.insert(RequestId::Number(1), "ping", created, deadline).is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_taken_entry_completes_once() {
        let mut table = PendingTable::default();
        let (created, deadline) = times();
        let receiver = table
            .insert(RequestId::Number(7), "tools/list", created, deadline)
            .unwrap();

        let entry = table.take(&RequestId::Number(7)).unwrap();
        assert!(table.take(&RequestId::Number(7)).is_none());
        assert_eq!(entry.method, "tools/list");
        assert!(entry.complete(Ok(json!({"tools": []}))));

        assert_eq!(receiver.await.unwrap().unwrap(), json!({"tools": []}));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_receiver_waits_for_completion() {
        let mut table = PendingTable::default();
        let (created, deadline) = times();
        let receiver = table
            .insert(RequestId::Number(3), "ping", created, deadline)
            .unwrap();

        let mut receiver = task::spawn(receiver);
        assert_pending!(receiver.poll());

        let entry = table.take(&RequestId::Number(3)).unwrap();
        assert!(entry.complete(Ok(json!({}))));
        assert!(receiver.is_woken());

        let outcome = assert_ready_ok!(receiver.poll());
        assert_eq!(outcome.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_drain_rejects_everything() {
        let mut table = PendingTable::default();
        let (created, deadline) = times();
        let receivers: Vec<_> = (0..3)
            .map(|n| table.insert(RequestId::Number(n), "ping", created, deadline).unwrap())
            .collect();

        for (_, entry) in table.drain() {
            entry.fail(McpClientError::connection_closing());
        }
        assert!(table.is_empty());

        for receiver in receivers {
            let err = receiver.await.unwrap().unwrap_err();
            assert_eq!(err.code, crate::error::codes::CONNECTION_CLOSING);
        }
    }

    #[test]
    fn test_completion_to_dropped_caller_reports_false() {
        let mut table = PendingTable::default();
        let (created, deadline) = times();
        drop(table.insert(RequestId::Number(1), "ping", created, deadline));

        let entry = table.take(&RequestId::Number(1)).unwrap();
        assert!(!entry.complete(Ok(Value::Null)));
    }
}
