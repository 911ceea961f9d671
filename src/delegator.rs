//! Rendezvous between a waiting HTTP caller and the route that produces its
//! answer. The ingress hands the sender half to the route execution and parks
//! on the slot until a value lands or the deadline passes.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// What the caller gets back: the surfaced value, if any, and whether one
/// arrived before the deadline.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DelegatorResponse {
    pub value: Option<JsonValue>,
    pub received: bool,
}

impl DelegatorResponse {
    pub fn received(value: JsonValue) -> Self {
        Self {
            value: Some(value),
            received: true,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            value: None,
            received: false,
        }
    }
}

pub fn response_slot() -> (ResponseSender, ResponseSlot) {
    let (tx, rx) = oneshot::channel();
    (ResponseSender { tx }, ResponseSlot { rx })
}

#[derive(Debug)]
pub struct ResponseSender {
    tx: oneshot::Sender<JsonValue>,
}

impl ResponseSender {
    /// Returns false when the caller already gave up waiting.
    pub fn fulfill(self, value: JsonValue) -> bool {
        self.tx.send(value).is_ok()
    }
}

#[derive(Debug)]
pub struct ResponseSlot {
    rx: oneshot::Receiver<JsonValue>,
}

impl ResponseSlot {
    pub async fn wait(self, deadline: Duration) -> DelegatorResponse {
        match timeout(deadline, self.rx).await {
            Ok(Ok(value)) => DelegatorResponse::received(value),
            // sender dropped without a value, or deadline hit
            Ok(Err(_)) | Err(_) => DelegatorResponse::timed_out(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fulfilled_slot_reports_received() {
        let (sender, slot) = response_slot();
        assert!(sender.fulfill(json!({"temperature": 21.5})));
        let response = slot.wait(Duration::from_millis(100)).await;
        assert!(response.received);
        assert_eq!(response.value, Some(json!({"temperature": 21.5})));
    }

    #[tokio::test]
    async fn deadline_yields_timed_out_response() {
        let (_sender, slot) = response_slot();
        let response = slot.wait(Duration::from_millis(10)).await;
        assert_eq!(response, DelegatorResponse::timed_out());
    }

    #[tokio::test]
    async fn dropped_sender_yields_timed_out_response() {
        let (sender, slot) = response_slot();
        drop(sender);
        let response = slot.wait(Duration::from_secs(1)).await;
        assert!(!response.received);
        assert!(response.value.is_none());
    }
}
