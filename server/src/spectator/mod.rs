// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The spectator hub: streams a player's frame bundles to watchers,
//! assembles a replay when the play ends, and reports the server-side
//! score back to the player.

pub mod replay;

use crate::app::App;
use crate::db::{rooms, scores, users};
use crate::error::InvokeError;
use crate::hub::{arg, Hub, HubClient, HubCore};
use async_trait::async_trait;
use cadence_common::mods::{ApiMod, Statistics};
use cadence_common::protocol::{WireIn, WireOut};
use cadence_common::spectator::{
    FrameDataBundle, LegacyReplayFrame, SpectatedUserState, SpectatorState, SpectatorUser,
};
use cadence_common::{ScoreTokenId, UserId};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How long to poll for the committed score after a play ends.
const SCORE_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const SCORE_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn watch_group(target: UserId) -> String {
    format!("watch:{target}")
}

/// Everything retained about one user's active play session.
struct PlaySession {
    state: SpectatorState,
    beatmap_status: i32,
    checksum: String,
    ruleset_id: i32,
    score_token: ScoreTokenId,
    username: String,
    mods: Vec<ApiMod>,
    statistics: Statistics,
    maximum_statistics: Statistics,
    frames: Vec<LegacyReplayFrame>,
}

#[derive(Default)]
struct SpectatorEntry {
    session: Option<PlaySession>,
    /// Whom this user is watching, for teardown notifications.
    watching: HashSet<UserId>,
}

pub struct SpectatorHub {
    core: HubCore,
    app: Arc<App>,
    entries: Mutex<HashMap<UserId, SpectatorEntry>>,
    replay_dir: PathBuf,
}

impl SpectatorHub {
    pub fn new(app: Arc<App>) -> Self {
        let negotiate_timeout = app.options.negotiate_timeout();
        let replay_dir = PathBuf::from(&app.options.replay_dir);
        Self {
            core: HubCore::new("spectator", negotiate_timeout),
            app,
            entries: Mutex::new(HashMap::new()),
            replay_dir,
        }
    }

    /// The state another hub (or a new watcher) should see for a user,
    /// or None while they are not in a play session.
    pub async fn playing_state(&self, user_id: UserId) -> Option<SpectatorState> {
        self.entries
            .lock()
            .await
            .get(&user_id)
            .and_then(|entry| entry.session.as_ref())
            .map(|session| session.state.clone())
    }

    /// Cross-hub notification used by the multiplayer hub when a match
    /// finishes: watchers of the player see a finished state even if the
    /// spectator session already unwound.
    pub fn broadcast_user_finished(&self, user_id: UserId, state: &SpectatorState) {
        self.core.broadcast_group(
            &watch_group(user_id),
            "UserFinishedPlaying",
            vec![WireOut::of(&user_id), WireOut::of(state)],
        );
    }

    async fn begin_play_session(
        &self,
        client: &Arc<HubClient>,
        score_token: ScoreTokenId,
        state: SpectatorState,
    ) -> Result<(), InvokeError> {
        let (Some(beatmap_id), Some(ruleset_id)) = (state.beatmap_id, state.ruleset_id) else {
            return Ok(());
        };
        let Some(beatmap) = rooms::beatmap(&self.app.db, beatmap_id.0).await? else {
            return Ok(());
        };
        let Some(user) = users::by_id(&self.app.db, client.user_id.0).await? else {
            return Ok(());
        };

        {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(client.user_id).or_default();
            if entry.session.is_some() {
                return Ok(());
            }
            entry.session = Some(PlaySession {
                state: state.clone(),
                beatmap_status: beatmap.beatmap_status,
                checksum: beatmap.checksum,
                ruleset_id: ruleset_id.0,
                score_token,
                username: user.username,
                mods: state.mods.clone(),
                statistics: Statistics::new(),
                maximum_statistics: state.maximum_statistics.clone(),
                frames: Vec::new(),
            });
        }

        self.core.broadcast_group(
            &watch_group(client.user_id),
            "UserBeganPlaying",
            vec![WireOut::of(&client.user_id), WireOut::of(&state)],
        );
        log::info!("[spectator] {} began playing {beatmap_id}", client.user_id);
        Ok(())
    }

    async fn send_frame_data(
        &self,
        client: &Arc<HubClient>,
        bundle: FrameDataBundle,
    ) -> Result<(), InvokeError> {
        {
            let mut entries = self.entries.lock().await;
            let Some(session) = entries
                .get_mut(&client.user_id)
                .and_then(|entry| entry.session.as_mut())
            else {
                return Ok(());
            };
            session.statistics = bundle.header.statistics.clone();
            session.mods = bundle.header.mods.clone();
            session.frames.extend(bundle.frames.iter().cloned());
        }
        self.core.broadcast_group(
            &watch_group(client.user_id),
            "UserSentFrames",
            vec![WireOut::of(&client.user_id), WireOut::of(&bundle)],
        );
        Ok(())
    }

    async fn end_play_session(
        &self,
        client: &Arc<HubClient>,
        mut final_state: SpectatorState,
    ) -> Result<(), InvokeError> {
        let session = {
            let mut entries = self.entries.lock().await;
            entries
                .get_mut(&client.user_id)
                .and_then(|entry| entry.session.take())
        };
        let Some(session) = session else {
            return Ok(());
        };

        if ranked_eligible(session.beatmap_status) && any_scorable_hit(&session.statistics) {
            self.reconcile_score(client, &session).await;
        }

        if final_state.state == SpectatedUserState::Playing {
            final_state.state = SpectatedUserState::Quit;
        }
        self.broadcast_user_finished(client.user_id, &final_state);
        Ok(())
    }

    /// Polls for the committed score, then persists the replay and tells
    /// the player their score landed. Giving up after the timeout is not
    /// an error.
    async fn reconcile_score(&self, client: &Arc<HubClient>, session: &PlaySession) {
        let deadline = tokio::time::Instant::now() + SCORE_POLL_TIMEOUT;
        let score = loop {
            match scores::score_by_token(&self.app.db, session.score_token.0, client.user_id.0)
                .await
            {
                Ok(Some(score)) => break Some(score),
                Ok(None) => {}
                Err(e) => {
                    log::error!("score token lookup failed: {e}");
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCORE_POLL_INTERVAL).await;
        };
        let Some(score) = score else {
            log::info!(
                "[spectator] no score materialized for token {}",
                session.score_token
            );
            return;
        };
        if !score.passed {
            return;
        }

        client.invoke_noblock(
            "UserScoreProcessed",
            vec![
                WireOut::of(&client.user_id),
                WireOut::of(&cadence_common::ScoreId(score.id)),
            ],
        );

        if let Err(e) = scores::mark_has_replay(&self.app.db, score.id).await {
            log::error!("failed to flag replay for score {}: {e}", score.id);
            return;
        }

        // LZMA work is CPU-bound; keep it off the event loop.
        let replay_dir = self.replay_dir.clone();
        let ruleset_id = session.ruleset_id;
        let checksum = session.checksum.clone();
        let username = session.username.clone();
        let mods = session.mods.clone();
        let statistics = session.statistics.clone();
        let maximum_statistics = session.maximum_statistics.clone();
        let frames = session.frames.clone();
        let result = tokio::task::spawn_blocking(move || {
            replay::save_replay(
                &replay_dir,
                ruleset_id,
                &checksum,
                &username,
                &score,
                &mods,
                &statistics,
                &maximum_statistics,
                &frames,
            )
        })
        .await;
        match result {
            Ok(Ok(path)) => log::info!("[spectator] replay saved to {}", path.display()),
            Ok(Err(e)) => log::error!("replay write failed: {e}"),
            Err(e) => log::error!("replay task panicked: {e}"),
        }
    }

    async fn start_watching(
        &self,
        client: &Arc<HubClient>,
        target: UserId,
    ) -> Result<(), InvokeError> {
        let target_state = {
            let mut entries = self.entries.lock().await;
            entries
                .entry(client.user_id)
                .or_default()
                .watching
                .insert(target);
            entries
                .get(&target)
                .and_then(|entry| entry.session.as_ref())
                .map(|session| session.state.clone())
        };

        // A watcher joining mid-play gets the current state immediately.
        if let Some(state) = target_state {
            client.invoke_noblock(
                "UserBeganPlaying",
                vec![WireOut::of(&target), WireOut::of(&state)],
            );
        }
        self.core.add_to_group(&watch_group(target), client.user_id);

        if let Some(target_client) = self.core.client(target) {
            let username = users::username_of(&self.app.db, client.user_id.0)
                .await?
                .unwrap_or_default();
            target_client.invoke_noblock(
                "UserStartedWatching",
                vec![WireOut::of(&vec![SpectatorUser {
                    user_id: client.user_id,
                    username,
                }])],
            );
        }
        Ok(())
    }

    async fn end_watching(&self, client: &Arc<HubClient>, target: UserId) {
        self.core.remove_from_group(&watch_group(target), client.user_id);
        self.entries
            .lock()
            .await
            .entry(client.user_id)
            .or_default()
            .watching
            .remove(&target);
        if let Some(target_client) = self.core.client(target) {
            target_client.invoke_noblock("UserEndedWatching", vec![WireOut::of(&client.user_id)]);
        }
    }
}

fn ranked_eligible(beatmap_status: i32) -> bool {
    // Ranked (1) through loved (4); pending and graveyard never submit.
    (1..=4).contains(&beatmap_status)
}

fn any_scorable_hit(statistics: &Statistics) -> bool {
    statistics
        .iter()
        .any(|(hit, &count)| hit.is_hit() && count > 0)
}

#[async_trait]
impl Hub for SpectatorHub {
    fn core(&self) -> &HubCore {
        &self.core
    }

    async fn on_connect(&self, client: &Arc<HubClient>) {
        // Replay every active play session so browsing spectators see who
        // is currently on a map.
        let playing: Vec<(UserId, SpectatorState)> = self
            .entries
            .lock()
            .await
            .iter()
            .filter_map(|(user_id, entry)| {
                entry
                    .session
                    .as_ref()
                    .map(|session| (*user_id, session.state.clone()))
            })
            .collect();
        for (user_id, state) in playing {
            client.invoke_noblock(
                "UserBeganPlaying",
                vec![WireOut::of(&user_id), WireOut::of(&state)],
            );
        }
    }

    async fn clean_state(&self, user_id: UserId) {
        let entry = self.entries.lock().await.remove(&user_id);
        let Some(entry) = entry else {
            return;
        };
        if let Some(session) = entry.session {
            let mut state = session.state;
            if state.state == SpectatedUserState::Playing {
                state.state = SpectatedUserState::Quit;
            }
            self.broadcast_user_finished(user_id, &state);
        }
        for target in entry.watching {
            self.core.remove_from_group(&watch_group(target), user_id);
            if let Some(target_client) = self.core.client(target) {
                target_client.invoke_noblock("UserEndedWatching", vec![WireOut::of(&user_id)]);
            }
        }
    }

    async fn dispatch(
        &self,
        client: &Arc<HubClient>,
        target: &str,
        args: &[WireIn],
    ) -> Result<Option<WireOut>, InvokeError> {
        match target {
            "BeginPlaySession" => {
                let score_token: ScoreTokenId = arg(args, 0)?;
                let state: SpectatorState = arg(args, 1)?;
                self.begin_play_session(client, score_token, state).await?;
            }
            "SendFrameData" => {
                self.send_frame_data(client, arg(args, 0)?).await?;
            }
            "EndPlaySession" => {
                self.end_play_session(client, arg(args, 0)?).await?;
            }
            "StartWatchingUser" => {
                self.start_watching(client, arg(args, 0)?).await?;
            }
            "EndWatchingUser" => {
                self.end_watching(client, arg(args, 0)?).await;
            }
            other => {
                return Err(InvokeError::new(format!("Method '{other}' not found in hub")));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::mods::HitResult;

    #[test]
    fn ranked_eligibility_window() {
        assert!(!ranked_eligible(-2));
        assert!(!ranked_eligible(0));
        assert!(ranked_eligible(1));
        assert!(ranked_eligible(4));
        assert!(!ranked_eligible(5));
    }

    #[test]
    fn scorable_hit_detection() {
        let mut statistics = Statistics::new();
        assert!(!any_scorable_hit(&statistics));
        statistics.insert(HitResult::Miss, 5);
        assert!(!any_scorable_hit(&statistics));
        statistics.insert(HitResult::Great, 0);
        assert!(!any_scorable_hit(&statistics));
        statistics.insert(HitResult::Great, 1);
        assert!(any_scorable_hit(&statistics));
    }
}
