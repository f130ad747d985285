use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::event::PermissionResponse;

/// Routes permission decisions to a turn stream that is waiting on them.
///
/// The adapter registers a slot *before* emitting the `PermissionRequest`
/// event so a caller that answers immediately cannot race the registration.
/// The bridge is shared (`Arc`) between the adapter and whoever owns the
/// agent, so decisions can arrive while the stream borrow is live.
#[derive(Default)]
pub struct PermissionBridge {
    pending: Mutex<HashMap<String, oneshot::Sender<PermissionResponse>>>,
}

impl PermissionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and return the receiver the adapter awaits.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<PermissionResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.to_string(), tx);
        rx
    }

    /// Resolve a pending request. Unknown or already-resolved ids are ignored.
    pub fn resolve(&self, response: PermissionResponse) {
        let sender = self.pending.lock().unwrap().remove(&response.request_id);
        if let Some(tx) = sender {
            let _ = tx.send(response);
        }
    }

    /// Drop a registration after a local timeout so a late reply is ignored.
    pub fn forget(&self, request_id: &str) {
        self.pending.lock().unwrap().remove(request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_before_await_is_not_lost() {
        let bridge = PermissionBridge::new();
        let rx = bridge.register("p1");
        bridge.resolve(PermissionResponse {
            request_id: "p1".into(),
            approved: true,
        });
        let response = rx.await.unwrap();
        assert!(response.approved);
    }

    #[tokio::test]
    async fn resolving_unknown_id_is_a_noop() {
        let bridge = PermissionBridge::new();
        bridge.resolve(PermissionResponse {
            request_id: "ghost".into(),
            approved: false,
        });
    }
}
