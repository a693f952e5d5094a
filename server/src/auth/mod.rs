// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Token issuance and the two-factor session verification state machine.

pub mod password;
pub mod routes;
pub mod tokens;
pub mod totp;
pub mod verification;

use crate::app::App;
use crate::error::ApiError;
use deadpool_redis::redis::AsyncCommands;

/// Clients older than this cannot render the TOTP prompt and always fall
/// back to mail verification.
pub const TOTP_VERIFICATION_MIN_API_VERSION: i32 = 20250913;

const AUTHORIZATION_CODE_TTL_SECS: u64 = 300;

fn authorization_code_key(client_id: i64, code: &str) -> String {
    format!("oauth:code:{client_id}:{code}")
}

/// Stores a single-use authorization code mapping to (user, scopes).
pub async fn store_authorization_code(
    app: &App,
    client_id: i64,
    code: &str,
    user_id: i64,
    scopes: &[&str],
) -> Result<(), ApiError> {
    let mut redis = app.redis().await?;
    let key = authorization_code_key(client_id, code);
    redis
        .hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("user_id", user_id.to_string()),
                ("scopes", scopes.join(",")),
            ],
        )
        .await?;
    redis
        .expire::<_, ()>(&key, AUTHORIZATION_CODE_TTL_SECS as i64)
        .await?;
    Ok(())
}

/// Redeems an authorization code. Single-use: the fields are deleted on
/// the first successful read.
pub async fn consume_authorization_code(
    app: &App,
    client_id: i64,
    code: &str,
) -> Result<Option<(i64, Vec<String>)>, ApiError> {
    let mut redis = app.redis().await?;
    let key = authorization_code_key(client_id, code);
    let user_id: Option<String> = redis.hget(&key, "user_id").await?;
    let scopes: Option<String> = redis.hget(&key, "scopes").await?;
    let (Some(user_id), Some(scopes)) = (user_id, scopes) else {
        return Ok(None);
    };
    redis.hdel::<_, _, ()>(&key, &["user_id", "scopes"]).await?;
    let Ok(user_id) = user_id.parse() else {
        return Ok(None);
    };
    Ok(Some((
        user_id,
        scopes.split(',').map(str::to_owned).collect(),
    )))
}
