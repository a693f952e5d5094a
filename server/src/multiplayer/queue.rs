// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Playlist queue policies. Host-only restricts who may add; all-players
//! appends; round-robin interleaves items per owner so everyone's picks
//! alternate fairly.

use super::room::ServerRoom;
use super::MultiplayerHub;
use crate::db::rooms;
use crate::error::InvokeError;
use cadence_common::multiplayer::{PlaylistItem, QueueMode};
use cadence_common::protocol::WireOut;
use cadence_common::{PlaylistItemId, UserId};
use chrono::Utc;

impl MultiplayerHub {
    pub(crate) async fn queue_add_item(
        &self,
        room: &mut ServerRoom,
        mut item: PlaylistItem,
        user_id: UserId,
    ) -> Result<(), InvokeError> {
        if room.room.settings.queue_mode == QueueMode::HostOnly && !room.is_host(user_id) {
            return Err(InvokeError::new(
                "Adding items to the queue is not allowed in host-only mode",
            ));
        }
        let beatmap = rooms::beatmap(&self.app.db, item.beatmap_id.0)
            .await?
            .ok_or_else(|| InvokeError::new("Failed to fetch beatmap, please retry later"))?;
        item.owner_id = user_id;
        item.checksum = beatmap.checksum;
        item.expired = false;
        item.played_at = None;
        item.order = room
            .room
            .playlist
            .iter()
            .map(|i| i.order + 1)
            .max()
            .unwrap_or(0);
        item.id = rooms::insert_playlist_item(&self.app.db, room.id(), &item).await?;
        room.room.playlist.push(item.clone());
        self.room_broadcast(room.id(), "PlaylistItemAdded", vec![WireOut::of(&item)]);

        if room.room.settings.queue_mode == QueueMode::AllPlayersRoundRobin {
            self.reorder_queue(room).await?;
        }

        // If everything had been played, the new item becomes current.
        if room.current_item().is_some_and(|current| current.expired) {
            self.point_at_item(room, item.id).await?;
        }
        Ok(())
    }

    pub(crate) async fn queue_edit_item(
        &self,
        room: &mut ServerRoom,
        item: PlaylistItem,
        user_id: UserId,
    ) -> Result<(), InvokeError> {
        let existing = room
            .item(item.id)
            .ok_or_else(|| InvokeError::new("Attempted to edit an item that does not exist"))?;
        if existing.expired {
            return Err(InvokeError::new("Attempted to edit an item that has already been played"));
        }
        if existing.owner_id != user_id && !room.is_host(user_id) {
            return Err(InvokeError::new(
                "Attempted to edit an item which is not owned by the user",
            ));
        }
        let beatmap = rooms::beatmap(&self.app.db, item.beatmap_id.0)
            .await?
            .ok_or_else(|| InvokeError::new("Failed to fetch beatmap, please retry later"))?;

        let (order, owner_id) = (existing.order, existing.owner_id);
        let updated = PlaylistItem {
            id: item.id,
            owner_id,
            checksum: beatmap.checksum,
            expired: false,
            played_at: None,
            order,
            ..item
        };
        rooms::update_playlist_item(&self.app.db, &updated).await?;
        if let Some(slot) = room.item_mut(updated.id) {
            *slot = updated.clone();
        }

        let is_current = room.room.settings.playlist_item_id == updated.id;
        if is_current {
            self.validate_styles(room).await?;
            self.unready_all_users(room, true).await?;
        }
        self.room_broadcast(room.id(), "PlaylistItemChanged", vec![WireOut::of(&updated)]);
        Ok(())
    }

    pub(crate) async fn queue_remove_item(
        &self,
        room: &mut ServerRoom,
        item_id: PlaylistItemId,
        user_id: UserId,
    ) -> Result<(), InvokeError> {
        let item = room
            .item(item_id)
            .ok_or_else(|| InvokeError::new("Attempted to remove an item that does not exist"))?;
        if item.owner_id != user_id && !room.is_host(user_id) {
            return Err(InvokeError::new(
                "Attempted to remove an item which is not owned by the user",
            ));
        }
        if item.expired {
            return Err(InvokeError::new("Attempted to remove an item that has already been played"));
        }
        if room.room.settings.playlist_item_id == item_id {
            return Err(InvokeError::new("The room's current item cannot be removed"));
        }
        rooms::delete_playlist_item(&self.app.db, item_id).await?;
        room.room.playlist.retain(|i| i.id != item_id);
        self.room_broadcast(room.id(), "PlaylistItemRemoved", vec![WireOut::of(&item_id)]);
        Ok(())
    }

    /// Expires the just-played item and advances to the next unexpired
    /// one. Host-only rotation re-queues a copy of the finished item so
    /// the room always has something to play.
    pub(crate) async fn finish_current_item(&self, room: &mut ServerRoom) -> Result<(), InvokeError> {
        let current_id = room.room.settings.playlist_item_id;
        let played_at = Utc::now();
        let expired_snapshot = match room.item_mut(current_id) {
            Some(item) if !item.expired => {
                item.expired = true;
                item.played_at = Some(played_at);
                Some(item.clone())
            }
            _ => None,
        };
        if let Some(snapshot) = expired_snapshot {
            rooms::expire_playlist_item(&self.app.db, current_id, played_at).await?;
            self.room_broadcast(room.id(), "PlaylistItemChanged", vec![WireOut::of(&snapshot)]);
        }

        if let Some(next) = next_unexpired(room) {
            self.point_at_item(room, next).await?;
            return Ok(());
        }

        if room.room.settings.queue_mode == QueueMode::HostOnly {
            // Duplicate the finished item so the host can go again.
            let Some(current) = room.item(current_id).cloned() else {
                return Ok(());
            };
            let mut copy = current;
            copy.expired = false;
            copy.played_at = None;
            copy.order = room
                .room
                .playlist
                .iter()
                .map(|i| i.order + 1)
                .max()
                .unwrap_or(0);
            copy.id = rooms::insert_playlist_item(&self.app.db, room.id(), &copy).await?;
            room.room.playlist.push(copy.clone());
            self.room_broadcast(room.id(), "PlaylistItemAdded", vec![WireOut::of(&copy)]);
            self.point_at_item(room, copy.id).await?;
        }
        Ok(())
    }

    /// Applies a queue-mode change: recompute ordering and re-point the
    /// current item if it expired under the old mode.
    pub(crate) async fn update_queue_mode(&self, room: &mut ServerRoom) -> Result<(), InvokeError> {
        self.reorder_queue(room).await?;
        if room.current_item().is_some_and(|item| item.expired) {
            if let Some(next) = next_unexpired(room) {
                self.point_at_item(room, next).await?;
            }
        }
        Ok(())
    }

    /// Recomputes playlist order for the active mode and pushes changed
    /// items to clients.
    async fn reorder_queue(&self, room: &mut ServerRoom) -> Result<(), InvokeError> {
        let ordering = match room.room.settings.queue_mode {
            QueueMode::AllPlayersRoundRobin => round_robin_order(&room.room.playlist),
            _ => insertion_order(&room.room.playlist),
        };
        let mut changed = Vec::new();
        for (item_id, order) in ordering {
            if let Some(item) = room.item_mut(item_id) {
                if item.order != order {
                    item.order = order;
                    changed.push(item.clone());
                }
            }
        }
        for item in changed {
            rooms::update_playlist_item(&self.app.db, &item).await?;
            self.room_broadcast(room.id(), "PlaylistItemChanged", vec![WireOut::of(&item)]);
        }
        Ok(())
    }

    /// Repoints `settings.playlist_item_id`; clients learn the new
    /// current item through the settings broadcast.
    async fn point_at_item(
        &self,
        room: &mut ServerRoom,
        item_id: PlaylistItemId,
    ) -> Result<(), InvokeError> {
        if room.room.settings.playlist_item_id == item_id {
            return Ok(());
        }
        room.room.settings.playlist_item_id = item_id;
        rooms::update_room_settings(
            &self.app.db,
            room.id(),
            &room.room.settings,
            room.room.host.as_ref().map(|h| h.user_id),
        )
        .await?;
        let settings = room.room.settings.clone();
        self.room_broadcast(room.id(), "SettingsChanged", vec![WireOut::of(&settings)]);
        Ok(())
    }
}

/// Queue order for the next pick: unexpired items by (order, id).
pub(crate) fn next_unexpired(room: &ServerRoom) -> Option<PlaylistItemId> {
    room.room
        .playlist
        .iter()
        .filter(|item| !item.expired)
        .min_by_key(|item| (item.order, item.id))
        .map(|item| item.id)
}

/// Unexpired items keep their relative insertion order; expired items
/// sort first so history stays stable at the top.
fn insertion_order(playlist: &[PlaylistItem]) -> Vec<(PlaylistItemId, i32)> {
    let mut items: Vec<&PlaylistItem> = playlist.iter().collect();
    items.sort_by_key(|item| (!item.expired, item.id));
    items
        .iter()
        .enumerate()
        .map(|(order, item)| (item.id, order as i32))
        .collect()
}

/// Round-robin: owners take turns, cycling through each owner's items in
/// insertion order. Expired items keep their played positions up front.
fn round_robin_order(playlist: &[PlaylistItem]) -> Vec<(PlaylistItemId, i32)> {
    let mut ordering = Vec::with_capacity(playlist.len());
    let mut order = 0;

    let mut expired: Vec<&PlaylistItem> = playlist.iter().filter(|item| item.expired).collect();
    expired.sort_by_key(|item| item.id);
    for item in expired {
        ordering.push((item.id, order));
        order += 1;
    }

    // Owners appear in first-insertion order; each round takes one item
    // from every owner that still has any.
    let mut owners: Vec<UserId> = Vec::new();
    for item in playlist.iter().filter(|item| !item.expired) {
        if !owners.contains(&item.owner_id) {
            owners.push(item.owner_id);
        }
    }
    let mut per_owner: Vec<Vec<&PlaylistItem>> = owners
        .iter()
        .map(|&owner| {
            let mut items: Vec<&PlaylistItem> = playlist
                .iter()
                .filter(|item| !item.expired && item.owner_id == owner)
                .collect();
            items.sort_by_key(|item| item.id);
            items
        })
        .collect();

    let mut round = 0;
    loop {
        let mut any = false;
        for items in &mut per_owner {
            if let Some(item) = items.get(round) {
                ordering.push((item.id, order));
                order += 1;
                any = true;
            }
        }
        if !any {
            break;
        }
        round += 1;
    }
    ordering
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::{BeatmapId, RulesetId};

    fn item(id: i64, owner: i64, expired: bool) -> PlaylistItem {
        PlaylistItem {
            id: PlaylistItemId(id),
            owner_id: UserId(owner),
            beatmap_id: BeatmapId(100 + id),
            checksum: String::new(),
            ruleset_id: RulesetId(0),
            required_mods: Vec::new(),
            allowed_mods: Vec::new(),
            expired,
            order: 0,
            played_at: None,
            star: 4.0,
            freestyle: false,
        }
    }

    #[test]
    fn round_robin_interleaves_owners() {
        // Alice queued three items, Bob two; turns must alternate.
        let playlist = vec![
            item(1, 1, false),
            item(2, 1, false),
            item(3, 2, false),
            item(4, 1, false),
            item(5, 2, false),
        ];
        let ordering = round_robin_order(&playlist);
        let by_order: Vec<i64> = {
            let mut sorted = ordering.clone();
            sorted.sort_by_key(|&(_, order)| order);
            sorted.iter().map(|(id, _)| id.0).collect()
        };
        assert_eq!(by_order, vec![1, 3, 2, 5, 4]);
    }

    #[test]
    fn round_robin_keeps_expired_first() {
        let playlist = vec![item(1, 1, true), item(2, 2, false), item(3, 1, false)];
        let ordering = round_robin_order(&playlist);
        let mut sorted = ordering.clone();
        sorted.sort_by_key(|&(_, order)| order);
        assert_eq!(sorted[0].0, PlaylistItemId(1));
    }

    #[test]
    fn insertion_order_is_stable() {
        let playlist = vec![item(3, 1, false), item(1, 2, true), item(2, 1, false)];
        let ordering = insertion_order(&playlist);
        let mut sorted = ordering.clone();
        sorted.sort_by_key(|&(_, order)| order);
        let ids: Vec<i64> = sorted.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
