// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::InvokeError;
use cadence_common::protocol::{CodecKind, Packet, WireIn, WireOut};
use cadence_common::UserId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// How long a server-initiated call waits for the client's Completion.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Invocation ids wrap modulo a large prime so they never collide with a
/// still-pending call.
const INVOCATION_ID_MODULUS: u64 = (1 << 61) - 1;

/// What the per-connection writer task should do next.
#[derive(Debug)]
pub enum ClientEvent {
    Packet(Packet<WireOut>),
    /// Send a Close packet, then drop the socket.
    Kick { error: Option<String> },
}

/// One live hub connection. Sends are fire-and-forget pushes onto the
/// writer task's channel, so they are safe to perform while holding hub
/// state locks.
pub struct HubClient {
    pub user_id: UserId,
    pub connection_id: String,
    pub connection_token: String,
    pub codec: CodecKind,
    sender: UnboundedSender<ClientEvent>,
    store: ResultStore,
}

impl HubClient {
    pub fn new(
        user_id: UserId,
        connection_token: String,
        codec: CodecKind,
        sender: UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            user_id,
            connection_id: user_id.to_string(),
            connection_token,
            codec,
            sender,
            store: ResultStore::default(),
        }
    }

    /// Returns false once the writer task is gone.
    pub fn send_packet(&self, packet: Packet<WireOut>) -> bool {
        self.sender.send(ClientEvent::Packet(packet)).is_ok()
    }

    pub fn kick(&self, error: Option<String>) {
        let _ = self.sender.send(ClientEvent::Kick { error });
    }

    /// Fire-and-forget invocation: no id is allocated, no completion is
    /// expected.
    pub fn invoke_noblock(&self, target: &str, arguments: Vec<WireOut>) {
        self.send_packet(Packet::invocation(None, target, arguments));
    }

    /// Server-to-client call that waits for the client's Completion.
    pub async fn invoke(
        &self,
        target: &str,
        arguments: Vec<WireOut>,
    ) -> Result<Option<WireIn>, InvokeError> {
        let (invocation_id, receiver) = self.store.register();
        if !self.send_packet(Packet::invocation(
            Some(invocation_id.clone()),
            target,
            arguments,
        )) {
            self.store.discard(&invocation_id);
            return Err(InvokeError::new("client is gone"));
        }
        match tokio::time::timeout(CALL_TIMEOUT, receiver).await {
            Ok(Ok(CompletionOutcome { error: None, result })) => Ok(result),
            Ok(Ok(CompletionOutcome { error: Some(error), .. })) => Err(InvokeError(error)),
            _ => {
                self.store.discard(&invocation_id);
                Err(InvokeError::new("client did not complete the invocation"))
            }
        }
    }

    /// Resolves a pending server-to-client call from an inbound
    /// Completion packet.
    pub fn complete(&self, invocation_id: &str, result: Option<WireIn>, error: Option<String>) {
        self.store.resolve(invocation_id, result, error);
    }
}

#[derive(Debug)]
pub struct CompletionOutcome {
    pub result: Option<WireIn>,
    pub error: Option<String>,
}

/// Pending server-initiated invocations, keyed by their allocated id.
#[derive(Default)]
struct ResultStore {
    seq: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<CompletionOutcome>>>,
}

impl ResultStore {
    fn register(&self) -> (String, oneshot::Receiver<CompletionOutcome>) {
        let id = (self.seq.fetch_add(1, Ordering::Relaxed) + 1) % INVOCATION_ID_MODULUS;
        let id = id.to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), sender);
        (id, receiver)
    }

    fn resolve(&self, id: &str, result: Option<WireIn>, error: Option<String>) {
        if let Some(sender) = self.pending.lock().unwrap().remove(id) {
            let _ = sender.send(CompletionOutcome { result, error });
        }
    }

    fn discard(&self, id: &str) {
        self.pending.lock().unwrap().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::protocol::WireValue;

    fn test_client() -> (HubClient, tokio::sync::mpsc::UnboundedReceiver<ClientEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (
            HubClient::new(UserId(1), "1:abc".to_owned(), CodecKind::MessagePack, sender),
            receiver,
        )
    }

    #[tokio::test]
    async fn call_resolves_on_completion() {
        let (client, mut receiver) = test_client();
        let client = std::sync::Arc::new(client);
        let caller = client.clone();
        let call =
            tokio::spawn(async move { caller.invoke("RequestState", Vec::new()).await });

        // The invocation must be on the wire before we fake the reply.
        let event = receiver.recv().await.unwrap();
        let ClientEvent::Packet(Packet::Invocation { invocation_id, .. }) = event else {
            panic!("expected invocation");
        };
        let id = invocation_id.unwrap();
        client.complete(&id, Some(WireIn::MessagePack(5i64.to_msgpack())), None);

        let result = call.await.unwrap().unwrap().unwrap();
        assert_eq!(result.parse::<i64>().unwrap(), 5);
    }

    #[tokio::test]
    async fn call_surfaces_client_error() {
        let (client, mut receiver) = test_client();
        let client = std::sync::Arc::new(client);
        let caller = client.clone();
        let call =
            tokio::spawn(async move { caller.invoke("RequestState", Vec::new()).await });

        let ClientEvent::Packet(Packet::Invocation { invocation_id, .. }) =
            receiver.recv().await.unwrap()
        else {
            panic!("expected invocation");
        };
        client.complete(&invocation_id.unwrap(), None, Some("nope".to_owned()));
        assert_eq!(call.await.unwrap().unwrap_err().to_string(), "nope");
    }

    #[test]
    fn invocation_ids_are_unique_and_increasing() {
        let store = ResultStore::default();
        let (a, _ra) = store.register();
        let (b, _rb) = store.register();
        assert_ne!(a, b);
        assert!(a.parse::<u64>().unwrap() < b.parse::<u64>().unwrap());
    }
}
