// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use sqlx::{FromRow, MySqlPool};

/// The sentinel bot account client-credential grants bind to.
pub const BOT_USER_ID: i64 = 2;

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub pw_bcrypt: Option<String>,
    pub country_code: String,
    pub is_bot: bool,
    pub is_restricted: bool,
    pub pm_friends_only: bool,
    pub playmode: i32,
    pub last_visit: Option<DateTime<Utc>>,
}

const USER_COLUMNS: &str = "id, username, email, pw_bcrypt, country_code, is_bot, is_restricted, \
     pm_friends_only, playmode, last_visit";

pub async fn by_id(pool: &MySqlPool, id: i64) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn by_username(pool: &MySqlPool, username: &str) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
    ))
    .bind(username)
    .fetch_optional(pool)
    .await
}

pub async fn by_email(pool: &MySqlPool, email: &str) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?"))
        .bind(email)
        .fetch_optional(pool)
        .await
}

pub async fn username_of(pool: &MySqlPool, id: i64) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT username FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn update_last_visit(pool: &MySqlPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET last_visit = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Relationship rows: `friend` follows, `block` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    Follow,
    Block,
}

pub async fn relationship(
    pool: &MySqlPool,
    user_id: i64,
    target_id: i64,
) -> Result<Option<RelationshipKind>, sqlx::Error> {
    let kind: Option<String> =
        sqlx::query_scalar("SELECT type FROM relationships WHERE user_id = ? AND target_id = ?")
            .bind(user_id)
            .bind(target_id)
            .fetch_optional(pool)
            .await?;
    Ok(kind.and_then(|kind| match kind.as_str() {
        "follow" => Some(RelationshipKind::Follow),
        "block" => Some(RelationshipKind::Block),
        _ => None,
    }))
}

/// Users this user follows. Presence fans out to a group per friend.
pub async fn friends_of(pool: &MySqlPool, user_id: i64) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT target_id FROM relationships WHERE user_id = ? AND type = 'follow'")
        .bind(user_id)
        .fetch_all(pool)
        .await
}

pub async fn blocked_either_way(
    pool: &MySqlPool,
    a: i64,
    b: i64,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM relationships \
         WHERE type = 'block' AND ((user_id = ? AND target_id = ?) OR (user_id = ? AND target_id = ?))",
    )
    .bind(a)
    .bind(b)
    .bind(b)
    .bind(a)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}
