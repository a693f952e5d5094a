// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::app::App;
use crate::db::{tokens, users};
use crate::error::ApiError;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    jti: String,
    iss: String,
}

/// Access tokens are JWTs; the random `jti` keeps every issued string
/// unique even within one clock second.
pub fn create_access_token(app: &App, user_id: i64) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now() + app.options.access_token_expire()).timestamp(),
        jti: hex::encode(rand::thread_rng().gen::<[u8; 16]>()),
        iss: "cadence".to_owned(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(app.options.jwt_secret.as_bytes()),
    )
    .expect("jwt encoding cannot fail with hmac")
}

pub fn generate_refresh_token() -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

/// Validates a `Bearer` header against stored tokens and resolves the
/// owning user. The token row, not the JWT signature, is authoritative:
/// sign-out and password changes delete rows.
pub async fn authenticate_bearer(
    app: &App,
    authorization: Option<&str>,
) -> Result<(users::UserRow, tokens::TokenRow), ApiError> {
    let header = authorization.ok_or(ApiError::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;
    let token_row = tokens::by_access_token(&app.db, token)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    let user = users::by_id(&app.db, token_row.user_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    Ok((user, token_row))
}

#[cfg(test)]
mod tests {
    use super::generate_refresh_token;
    use std::collections::HashSet;

    #[test]
    fn refresh_tokens_are_long_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let token = generate_refresh_token();
            assert_eq!(token.len(), 64);
            assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(seen.insert(token));
        }
    }
}

/// As [`authenticate_bearer`], additionally requiring the given scope
/// (the wildcard scope always passes).
pub async fn authenticate_bearer_with_scope(
    app: &App,
    authorization: Option<&str>,
    scope: &str,
) -> Result<(users::UserRow, tokens::TokenRow), ApiError> {
    let (user, token) = authenticate_bearer(app, authorization).await?;
    let scopes = token.scopes();
    if !scopes.contains(&"*") && !scopes.contains(&scope) {
        return Err(ApiError::Forbidden("insufficient scope".to_owned()));
    }
    Ok((user, token))
}
