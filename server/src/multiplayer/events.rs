// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Append-only room event log. Logging failures are never allowed to
//! fail the transition they describe.

use super::MultiplayerHub;
use crate::db::rooms;
use cadence_common::{PlaylistItemId, RoomId, UserId};

impl MultiplayerHub {
    pub(crate) async fn log_room_event(&self, room_id: RoomId, user_id: UserId, event_type: &str) {
        if let Err(e) =
            rooms::insert_room_event(&self.app.db, room_id, Some(user_id), None, event_type, None)
                .await
        {
            log::warn!("failed to log room event {event_type} for {room_id}: {e}");
        }
    }

    pub(crate) async fn log_game_event(
        &self,
        room_id: RoomId,
        item_id: PlaylistItemId,
        event_type: &str,
        detail: Option<serde_json::Value>,
    ) {
        if let Err(e) =
            rooms::insert_room_event(&self.app.db, room_id, None, Some(item_id), event_type, detail)
                .await
        {
            log::warn!("failed to log room event {event_type} for {room_id}: {e}");
        }
    }
}
