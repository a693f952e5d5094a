// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use sqlx::{FromRow, MySqlPool};

#[derive(Debug, Clone, FromRow)]
pub struct ScoreRow {
    pub id: i64,
    pub user_id: i64,
    pub beatmap_id: i64,
    pub passed: bool,
    pub rank: String,
    pub total_score: i64,
    pub total_score_without_mods: i64,
    pub max_combo: i32,
    pub is_perfect_combo: bool,
    pub n300: i32,
    pub n100: i32,
    pub n50: i32,
    pub ngeki: i32,
    pub nkatu: i32,
    pub nmiss: i32,
    pub pp: f64,
    pub started_at: DateTime<Utc>,
    #[sqlx(rename = "type")]
    pub score_type: String,
    pub room_id: Option<i64>,
    pub playlist_item_id: Option<i64>,
}

// `rank` needs quoting: reserved since MySQL 8.
const SCORE_COLUMNS: &str = "id, user_id, beatmap_id, passed, `rank`, total_score, \
     total_score_without_mods, max_combo, is_perfect_combo, n300, n100, n50, ngeki, nkatu, \
     nmiss, pp, started_at, type, room_id, playlist_item_id";

/// Resolves the score a score-token points at, once score submission has
/// committed it. Returns None while the score is still processing.
pub async fn score_by_token(
    pool: &MySqlPool,
    score_token: i64,
    user_id: i64,
) -> Result<Option<ScoreRow>, sqlx::Error> {
    sqlx::query_as::<_, ScoreRow>(&format!(
        "SELECT {SCORE_COLUMNS} FROM scores \
         WHERE id = (SELECT score_id FROM score_tokens WHERE id = ?) AND user_id = ?"
    ))
    .bind(score_token)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn score_by_id(pool: &MySqlPool, score_id: i64) -> Result<Option<ScoreRow>, sqlx::Error> {
    sqlx::query_as::<_, ScoreRow>(&format!("SELECT {SCORE_COLUMNS} FROM scores WHERE id = ?"))
        .bind(score_id)
        .fetch_optional(pool)
        .await
}

pub async fn mark_has_replay(pool: &MySqlPool, score_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE scores SET has_replay = TRUE WHERE id = ?")
        .bind(score_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn recent_passed_score(
    pool: &MySqlPool,
    user_id: i64,
) -> Result<Option<ScoreRow>, sqlx::Error> {
    sqlx::query_as::<_, ScoreRow>(&format!(
        "SELECT {SCORE_COLUMNS} FROM scores \
         WHERE user_id = ? AND passed = TRUE ORDER BY id DESC LIMIT 1"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn recent_score(pool: &MySqlPool, user_id: i64) -> Result<Option<ScoreRow>, sqlx::Error> {
    sqlx::query_as::<_, ScoreRow>(&format!(
        "SELECT {SCORE_COLUMNS} FROM scores WHERE user_id = ? ORDER BY id DESC LIMIT 1"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

#[derive(Debug, Clone, FromRow)]
pub struct StatisticsRow {
    pub pp: f64,
    pub hit_accuracy: f64,
    pub play_count: i64,
    pub ranked_score: i64,
}

pub async fn user_statistics(
    pool: &MySqlPool,
    user_id: i64,
    mode: i32,
) -> Result<Option<StatisticsRow>, sqlx::Error> {
    sqlx::query_as::<_, StatisticsRow>(
        "SELECT pp, hit_accuracy, play_count, ranked_score FROM user_statistics \
         WHERE user_id = ? AND mode = ?",
    )
    .bind(user_id)
    .bind(mode)
    .fetch_optional(pool)
    .await
}
