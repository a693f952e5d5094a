// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Live room state and countdown scheduling.

use super::MultiplayerHub;
use cadence_common::multiplayer::{
    ForceGameplayStartCountdown, MatchStartCountdown, MultiplayerCountdown, MultiplayerRoom,
    MultiplayerRoomUser, PlaylistItem, ServerShuttingDownCountdown,
};
use cadence_common::protocol::{TimeSpan, WireOut};
use cadence_common::{CountdownId, RoomId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a countdown does when it elapses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CountdownContinuation {
    StartMatch,
    StartGameplay,
    /// Announcement only (server shutdown).
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CountdownKind {
    MatchStart,
    ForceGameplayStart,
    ServerShuttingDown,
}

impl CountdownKind {
    fn build(self, id: CountdownId, time_remaining: TimeSpan) -> MultiplayerCountdown {
        match self {
            Self::MatchStart => MultiplayerCountdown::MatchStart(MatchStartCountdown {
                id,
                time_remaining,
            }),
            Self::ForceGameplayStart => {
                MultiplayerCountdown::ForceGameplayStart(ForceGameplayStartCountdown {
                    id,
                    time_remaining,
                })
            }
            Self::ServerShuttingDown => {
                MultiplayerCountdown::ServerShuttingDown(ServerShuttingDownCountdown {
                    id,
                    time_remaining,
                })
            }
        }
    }

    fn matches(self, countdown: &MultiplayerCountdown) -> bool {
        matches!(
            (self, countdown),
            (Self::MatchStart, MultiplayerCountdown::MatchStart(_))
                | (Self::ForceGameplayStart, MultiplayerCountdown::ForceGameplayStart(_))
                | (Self::ServerShuttingDown, MultiplayerCountdown::ServerShuttingDown(_))
        )
    }
}

pub struct ActiveCountdown {
    pub info: MultiplayerCountdown,
    pub continuation: CountdownContinuation,
    /// Auto-start countdowns cannot be stopped by a client request.
    pub from_auto_start: bool,
    handle: tokio::task::JoinHandle<()>,
}

/// The authoritative in-memory state of one room. The wire model inside
/// is what late joiners receive verbatim, so it is kept current as
/// countdowns and users come and go.
pub struct ServerRoom {
    pub room: MultiplayerRoom,
    pub countdowns: HashMap<CountdownId, ActiveCountdown>,
    next_countdown_id: i32,
}

impl ServerRoom {
    pub fn new(room: MultiplayerRoom) -> Self {
        Self {
            room,
            countdowns: HashMap::new(),
            next_countdown_id: 1,
        }
    }

    pub fn id(&self) -> RoomId {
        self.room.room_id
    }

    pub fn user(&self, user_id: UserId) -> Option<&MultiplayerRoomUser> {
        self.room.users.iter().find(|u| u.user_id == user_id)
    }

    pub fn user_mut(&mut self, user_id: UserId) -> Option<&mut MultiplayerRoomUser> {
        self.room.users.iter_mut().find(|u| u.user_id == user_id)
    }

    pub fn is_host(&self, user_id: UserId) -> bool {
        self.room
            .host
            .as_ref()
            .is_some_and(|host| host.user_id == user_id)
    }

    /// The item the room is currently set to play. Falls back to the
    /// first queued item if the pointer has gone stale.
    pub fn current_item(&self) -> Option<&PlaylistItem> {
        self.room
            .playlist
            .iter()
            .find(|item| item.id == self.room.settings.playlist_item_id)
            .or_else(|| self.room.playlist.first())
    }

    pub fn item(&self, id: cadence_common::PlaylistItemId) -> Option<&PlaylistItem> {
        self.room.playlist.iter().find(|item| item.id == id)
    }

    pub fn item_mut(&mut self, id: cadence_common::PlaylistItemId) -> Option<&mut PlaylistItem> {
        self.room.playlist.iter_mut().find(|item| item.id == id)
    }

    fn allocate_countdown_id(&mut self) -> CountdownId {
        let id = CountdownId(self.next_countdown_id);
        self.next_countdown_id += 1;
        id
    }

    pub fn stop_all_countdowns(&mut self) {
        for (_, countdown) in self.countdowns.drain() {
            countdown.handle.abort();
        }
        self.room.active_countdowns.clear();
    }
}

impl MultiplayerHub {
    /// Starts a countdown. Exclusive countdowns (and fresh countdowns of
    /// an already-ticking kind) displace the previous one of that kind:
    /// at most one countdown per kind exists at a time.
    pub(crate) fn start_countdown(
        &self,
        room: &mut ServerRoom,
        kind: CountdownKind,
        duration: Duration,
        continuation: CountdownContinuation,
        from_auto_start: bool,
    ) -> CountdownId {
        let stale: Vec<CountdownId> = room
            .countdowns
            .values()
            .filter(|active| kind.matches(&active.info))
            .map(|active| active.info.id())
            .collect();
        for id in stale {
            self.stop_countdown(room, id);
        }

        let id = room.allocate_countdown_id();
        let info = kind.build(id, TimeSpan(duration));
        let room_id = room.id();
        let hub = self.clone_handle();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            hub.countdown_elapsed(room_id, id).await;
        });
        room.countdowns.insert(
            id,
            ActiveCountdown {
                info: info.clone(),
                continuation,
                from_auto_start,
                handle,
            },
        );
        room.room.active_countdowns.push(info.clone());
        self.send_match_event(
            room,
            cadence_common::multiplayer::MatchServerEvent::CountdownStarted(
                cadence_common::multiplayer::CountdownStartedEvent { countdown: info },
            ),
        );
        id
    }

    /// Cancels a countdown without firing its continuation.
    pub(crate) fn stop_countdown(&self, room: &mut ServerRoom, id: CountdownId) {
        let Some(active) = room.countdowns.remove(&id) else {
            return;
        };
        active.handle.abort();
        room.room.active_countdowns.retain(|c| c.id() != id);
        self.send_match_event(
            room,
            cadence_common::multiplayer::MatchServerEvent::CountdownStopped(
                cadence_common::multiplayer::CountdownStoppedEvent { id },
            ),
        );
    }

    pub(crate) fn stop_countdowns_of_kind(&self, room: &mut ServerRoom, kind: CountdownKind) {
        let ids: Vec<CountdownId> = room
            .countdowns
            .values()
            .filter(|active| kind.matches(&active.info))
            .map(|active| active.info.id())
            .collect();
        for id in ids {
            self.stop_countdown(room, id);
        }
    }

    pub(crate) fn has_countdown_of_kind(&self, room: &ServerRoom, kind: CountdownKind) -> bool {
        room.countdowns
            .values()
            .any(|active| kind.matches(&active.info))
    }

    /// Countdown task body: re-acquires the room, checks the countdown is
    /// still live, and drives the registered continuation.
    async fn countdown_elapsed(&self, room_id: RoomId, id: CountdownId) {
        let Some(room_lock) = self.room_by_id(room_id) else {
            return;
        };
        let mut room = room_lock.lock().await;
        let Some(active) = room.countdowns.remove(&id) else {
            // Stopped in the window between firing and locking.
            return;
        };
        room.room.active_countdowns.retain(|c| c.id() != id);
        self.send_match_event(
            &room,
            cadence_common::multiplayer::MatchServerEvent::CountdownStopped(
                cadence_common::multiplayer::CountdownStoppedEvent { id },
            ),
        );
        match active.continuation {
            CountdownContinuation::StartMatch => {
                if let Err(e) = self.start_match(&mut room).await {
                    log::info!("[multiplayer] countdown match start skipped: {e}");
                }
                if let Err(e) = self.update_room_state(&mut room).await {
                    log::error!("[multiplayer] room update after countdown failed: {e}");
                }
            }
            CountdownContinuation::StartGameplay => {
                if let Err(e) = self.start_gameplay(&mut room).await {
                    log::info!("[multiplayer] forced gameplay start skipped: {e}");
                }
            }
            CountdownContinuation::None => {}
        }
    }

    pub(crate) fn send_match_event(
        &self,
        room: &ServerRoom,
        event: cadence_common::multiplayer::MatchServerEvent,
    ) {
        self.room_broadcast(room.id(), "MatchEvent", vec![WireOut::of(&event)]);
    }
}
