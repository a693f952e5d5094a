// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The hub runtime: strongly-typed RPC over WebSocket with correlation
//! ids, group broadcast, keepalive and pluggable wire codecs.

mod client;
pub mod router;

pub use client::{ClientEvent, HubClient};

use crate::error::InvokeError;
use async_trait::async_trait;
use cadence_common::protocol::{Packet, WireError, WireIn, WireOut, WireValue};
use cadence_common::UserId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

impl From<WireError> for InvokeError {
    fn from(e: WireError) -> Self {
        Self::new(format!("invalid argument: {e}"))
    }
}

/// Parses the invocation argument at `index`, rejecting the call if it is
/// missing or malformed.
pub fn arg<T: WireValue>(args: &[WireIn], index: usize) -> Result<T, InvokeError> {
    let value = args
        .get(index)
        .ok_or_else(|| InvokeError::new(format!("missing argument {index}")))?;
    Ok(value.parse()?)
}

/// Connection bookkeeping shared by every hub: live clients, negotiated
/// tokens awaiting their socket, and broadcast groups. All sends are
/// channel pushes, so the maps use plain mutexes and are never held
/// across awaits.
pub struct HubCore {
    pub name: &'static str,
    negotiate_timeout: Duration,
    clients: Mutex<HashMap<UserId, Arc<HubClient>>>,
    waited: Mutex<HashMap<String, Instant>>,
    groups: Mutex<HashMap<String, HashSet<UserId>>>,
}

impl HubCore {
    pub fn new(name: &'static str, negotiate_timeout: Duration) -> Self {
        Self {
            name,
            negotiate_timeout,
            clients: Mutex::new(HashMap::new()),
            waited: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_waited(&self, connection_token: String) {
        self.waited
            .lock()
            .unwrap()
            .insert(connection_token, Instant::now());
    }

    pub fn is_waited(&self, connection_token: &str) -> bool {
        self.waited.lock().unwrap().contains_key(connection_token)
    }

    /// Claims a negotiated token for its socket. Fails if negotiate never
    /// happened or the client dawdled past the timeout.
    pub fn take_waited(&self, connection_token: &str) -> Result<(), &'static str> {
        let since = self
            .waited
            .lock()
            .unwrap()
            .remove(connection_token)
            .ok_or("connection was not negotiated")?;
        if since.elapsed() > self.negotiate_timeout {
            return Err("connection has waited too long");
        }
        Ok(())
    }

    /// Registers the client, returning the predecessor to kick if the
    /// user already had a live connection.
    pub fn insert_client(&self, client: Arc<HubClient>) -> Option<Arc<HubClient>> {
        let token = client.connection_token.clone();
        self.clients
            .lock()
            .unwrap()
            .insert(client.user_id, client)
            // A reconnect with the same token is not a predecessor.
            .filter(|old| old.connection_token != token)
    }

    /// Removes the client only if this token is still the live one, so a
    /// kicked predecessor's teardown cannot evict its replacement.
    pub fn remove_client(&self, user_id: UserId, connection_token: &str) -> Option<Arc<HubClient>> {
        let mut clients = self.clients.lock().unwrap();
        if clients
            .get(&user_id)
            .is_some_and(|c| c.connection_token == connection_token)
        {
            let client = clients.remove(&user_id);
            drop(clients);
            let mut groups = self.groups.lock().unwrap();
            for members in groups.values_mut() {
                members.remove(&user_id);
            }
            groups.retain(|_, members| !members.is_empty());
            client
        } else {
            None
        }
    }

    pub fn client(&self, user_id: UserId) -> Option<Arc<HubClient>> {
        self.clients.lock().unwrap().get(&user_id).cloned()
    }

    pub fn clients(&self) -> Vec<Arc<HubClient>> {
        self.clients.lock().unwrap().values().cloned().collect()
    }

    pub fn add_to_group(&self, group: &str, user_id: UserId) {
        self.groups
            .lock()
            .unwrap()
            .entry(group.to_owned())
            .or_default()
            .insert(user_id);
    }

    pub fn remove_from_group(&self, group: &str, user_id: UserId) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(members) = groups.get_mut(group) {
            members.remove(&user_id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    pub fn group_members(&self, group: &str) -> Vec<Arc<HubClient>> {
        let members: Vec<UserId> = self
            .groups
            .lock()
            .unwrap()
            .get(group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        let clients = self.clients.lock().unwrap();
        members
            .iter()
            .filter_map(|user_id| clients.get(user_id).cloned())
            .collect()
    }

    /// Fans a no-block invocation out to every member of the group.
    pub fn broadcast_group(&self, group: &str, target: &str, arguments: Vec<WireOut>) {
        for client in self.group_members(group) {
            client.send_packet(Packet::invocation(None, target, arguments.clone()));
        }
    }

    pub fn broadcast_all(&self, target: &str, arguments: Vec<WireOut>) {
        for client in self.clients() {
            client.send_packet(Packet::invocation(None, target, arguments.clone()));
        }
    }
}

/// A logical RPC endpoint over WebSocket.
#[async_trait]
pub trait Hub: Send + Sync + 'static {
    fn core(&self) -> &HubCore;

    /// Dispatches one client invocation. A returned value (if any) rides
    /// back on the Completion packet.
    async fn dispatch(
        &self,
        client: &Arc<HubClient>,
        target: &str,
        args: &[WireIn],
    ) -> Result<Option<WireOut>, InvokeError>;

    /// Called once the handshake finishes, off the read loop.
    async fn on_connect(&self, _client: &Arc<HubClient>) {}

    /// Drops any per-user state the hub kept for a departed connection.
    async fn clean_state(&self, _user_id: UserId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::protocol::CodecKind;
    use tokio::sync::mpsc::unbounded_channel;

    fn client(user_id: i64, token: &str) -> (Arc<HubClient>, tokio::sync::mpsc::UnboundedReceiver<ClientEvent>) {
        let (sender, receiver) = unbounded_channel();
        (
            Arc::new(HubClient::new(
                UserId(user_id),
                token.to_owned(),
                CodecKind::Json,
                sender,
            )),
            receiver,
        )
    }

    #[test]
    fn replacing_a_connection_returns_the_predecessor() {
        let core = HubCore::new("test", Duration::from_secs(30));
        let (first, _rx1) = client(7, "7:first");
        let (second, _rx2) = client(7, "7:second");
        assert!(core.insert_client(first).is_none());
        let predecessor = core.insert_client(second).expect("predecessor");
        assert_eq!(predecessor.connection_token, "7:first");

        // The predecessor's teardown must not evict the replacement.
        assert!(core.remove_client(UserId(7), "7:first").is_none());
        assert!(core.client(UserId(7)).is_some());
        assert!(core.remove_client(UserId(7), "7:second").is_some());
        assert!(core.client(UserId(7)).is_none());
    }

    #[test]
    fn group_broadcast_reaches_members_only() {
        let core = HubCore::new("test", Duration::from_secs(30));
        let (a, mut rx_a) = client(1, "1:a");
        let (b, mut rx_b) = client(2, "2:b");
        core.insert_client(a);
        core.insert_client(b);
        core.add_to_group("room:5", UserId(1));

        core.broadcast_group("room:5", "UserJoined", Vec::new());
        assert!(matches!(rx_a.try_recv(), Ok(ClientEvent::Packet(_))));
        assert!(rx_b.try_recv().is_err());

        core.remove_from_group("room:5", UserId(1));
        core.broadcast_group("room:5", "UserJoined", Vec::new());
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn leaving_removes_group_membership() {
        let core = HubCore::new("test", Duration::from_secs(30));
        let (a, mut rx_a) = client(1, "1:a");
        core.insert_client(a);
        core.add_to_group("watch:9", UserId(1));
        core.remove_client(UserId(1), "1:a");
        core.broadcast_group("watch:9", "UserSentFrames", Vec::new());
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn waited_tokens_expire() {
        let core = HubCore::new("test", Duration::from_millis(10));
        core.add_waited("1:tok".to_owned());
        assert!(core.is_waited("1:tok"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(core.take_waited("1:tok").is_err());
        assert!(core.take_waited("1:unknown").is_err());
    }
}
