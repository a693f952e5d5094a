// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use sqlx::{FromRow, MySqlPool};

#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub id: i64,
    pub user_id: i64,
    pub client_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}

impl TokenRow {
    pub fn scopes(&self) -> Vec<&str> {
        self.scope.split(',').filter(|s| !s.is_empty()).collect()
    }
}

const TOKEN_COLUMNS: &str =
    "id, user_id, client_id, access_token, refresh_token, scope, expires_at, refresh_token_expires_at";

/// Stores a freshly issued token pair. Unless multi-device login is
/// enabled, previous tokens for the same (user, client) are dropped so a
/// new sign-in invalidates the old session.
#[allow(clippy::too_many_arguments)]
pub async fn store_token(
    pool: &MySqlPool,
    user_id: i64,
    client_id: i64,
    scopes: &[&str],
    access_token: &str,
    refresh_token: &str,
    expires_at: DateTime<Utc>,
    refresh_token_expires_at: DateTime<Utc>,
    allow_multiple_devices: bool,
) -> Result<TokenRow, sqlx::Error> {
    let mut tx = pool.begin().await?;
    if !allow_multiple_devices {
        sqlx::query("DELETE FROM oauth_tokens WHERE user_id = ? AND client_id = ?")
            .bind(user_id)
            .bind(client_id)
            .execute(&mut *tx)
            .await?;
    }
    // access_token is unique; a duplicate would be a stale row.
    sqlx::query("DELETE FROM oauth_tokens WHERE access_token = ?")
        .bind(access_token)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query(
        "INSERT INTO oauth_tokens \
         (user_id, client_id, access_token, refresh_token, scope, expires_at, refresh_token_expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(client_id)
    .bind(access_token)
    .bind(refresh_token)
    .bind(scopes.join(","))
    .bind(expires_at)
    .bind(refresh_token_expires_at)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(TokenRow {
        id: result.last_insert_id() as i64,
        user_id,
        client_id,
        access_token: access_token.to_owned(),
        refresh_token: refresh_token.to_owned(),
        scope: scopes.join(","),
        expires_at,
        refresh_token_expires_at,
    })
}

pub async fn by_access_token(
    pool: &MySqlPool,
    access_token: &str,
) -> Result<Option<TokenRow>, sqlx::Error> {
    sqlx::query_as::<_, TokenRow>(&format!(
        "SELECT {TOKEN_COLUMNS} FROM oauth_tokens WHERE access_token = ? AND expires_at > ?"
    ))
    .bind(access_token)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await
}

pub async fn by_refresh_token(
    pool: &MySqlPool,
    refresh_token: &str,
) -> Result<Option<TokenRow>, sqlx::Error> {
    sqlx::query_as::<_, TokenRow>(&format!(
        "SELECT {TOKEN_COLUMNS} FROM oauth_tokens \
         WHERE refresh_token = ? AND refresh_token_expires_at > ?"
    ))
    .bind(refresh_token)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await
}

pub async fn client_credentials_valid(
    pool: &MySqlPool,
    client_id: i64,
    client_secret: &str,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM oauth_clients WHERE client_id = ? AND client_secret = ?",
    )
    .bind(client_id)
    .bind(client_secret)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}
