// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-mode match state. Head-to-head is stateless; team-versus assigns
//! each joining user to the smaller team and honors team-change requests.

use super::room::ServerRoom;
use super::MultiplayerHub;
use crate::error::InvokeError;
use cadence_common::multiplayer::{
    MatchRoomState, MatchType, MatchUserState, TeamVersusRoomState, TeamVersusUserState,
};
use cadence_common::protocol::WireOut;
use cadence_common::{TeamId, UserId};

impl MultiplayerHub {
    /// Installs the match-type handler, resetting per-user match state to
    /// whatever the new mode requires.
    pub(crate) fn apply_match_type(&self, room: &mut ServerRoom, match_type: MatchType) {
        match match_type {
            MatchType::TeamVersus => {
                room.room.match_state =
                    Some(MatchRoomState::TeamVersus(TeamVersusRoomState::red_and_blue()));
                let users: Vec<UserId> = room.room.users.iter().map(|u| u.user_id).collect();
                for user_id in users {
                    self.match_type_join(room, user_id);
                }
            }
            _ => {
                room.room.match_state = None;
                for user in &mut room.room.users {
                    user.match_state = None;
                }
                let users: Vec<UserId> = room.room.users.iter().map(|u| u.user_id).collect();
                for user_id in users {
                    self.broadcast_match_user_state(room, user_id);
                }
            }
        }
        self.room_broadcast(
            room.id(),
            "MatchRoomStateChanged",
            vec![WireOut::of(&room.room.match_state)],
        );
    }

    /// Joining users land on the team with fewer members.
    pub(crate) fn match_type_join(&self, room: &mut ServerRoom, user_id: UserId) {
        if room.room.settings.match_type != MatchType::TeamVersus {
            return;
        }
        let red = self.team_size(room, TeamId(0));
        let blue = self.team_size(room, TeamId(1));
        let team_id = if blue < red { TeamId(1) } else { TeamId(0) };
        if let Some(user) = room.user_mut(user_id) {
            user.match_state = Some(MatchUserState::TeamVersus(TeamVersusUserState { team_id }));
        }
        self.broadcast_match_user_state(room, user_id);
    }

    fn team_size(&self, room: &ServerRoom, team_id: TeamId) -> usize {
        room.room
            .users
            .iter()
            .filter(|u| {
                matches!(
                    &u.match_state,
                    Some(MatchUserState::TeamVersus(state)) if state.team_id == team_id
                )
            })
            .count()
    }

    pub(crate) fn handle_change_team(
        &self,
        room: &mut ServerRoom,
        user_id: UserId,
        team_id: TeamId,
    ) -> Result<(), InvokeError> {
        if room.room.settings.match_type != MatchType::TeamVersus {
            // Head-to-head silently ignores team requests.
            return Ok(());
        }
        let valid = match &room.room.match_state {
            Some(MatchRoomState::TeamVersus(state)) => {
                state.teams.iter().any(|team| team.id == team_id)
            }
            _ => false,
        };
        if !valid {
            return Err(InvokeError::new("Attempted to set a non-existent team"));
        }
        if let Some(user) = room.user_mut(user_id) {
            user.match_state = Some(MatchUserState::TeamVersus(TeamVersusUserState { team_id }));
        }
        self.broadcast_match_user_state(room, user_id);
        Ok(())
    }

    fn broadcast_match_user_state(&self, room: &ServerRoom, user_id: UserId) {
        let state = room.user(user_id).and_then(|u| u.match_state.clone());
        self.room_broadcast(
            room.id(),
            "MatchUserStateChanged",
            vec![WireOut::of(&user_id), WireOut::of(&state)],
        );
    }

    /// Event-log detail for a starting game.
    pub(crate) fn match_started_detail(&self, room: &ServerRoom) -> serde_json::Value {
        serde_json::json!({
            "match_type": room.room.settings.match_type.as_str(),
        })
    }
}
