// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session verification plumbing: the chosen-method key in Redis, e-mail
//! code issuance, trusted-device checks and the verified flip.

use crate::app::App;
use crate::db::users::UserRow;
use crate::db::verification;
use crate::error::ApiError;
use crate::user_agent::ClientKind;
use deadpool_redis::redis::AsyncCommands;
use rand::Rng;

const EMAIL_CODE_DIGITS: usize = 8;
const EMAIL_CODE_TTL_SECS: u64 = 600;
const EMAIL_RESEND_LIMIT_SECS: u64 = 60;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerificationMethod {
    Totp,
    Mail,
}

impl VerificationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Mail => "mail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "totp" => Some(Self::Totp),
            "mail" => Some(Self::Mail),
            _ => None,
        }
    }
}

fn method_key(user_id: i64, token_id: i64) -> String {
    format!("session_verification_method:{user_id}:{token_id}")
}

fn email_code_key(user_id: i64, code: &str) -> String {
    format!("email_verification:{user_id}:{code}")
}

fn email_rate_limit_key(user_id: i64) -> String {
    format!("email_verification_rate_limit:{user_id}")
}

pub async fn chosen_method(
    app: &App,
    user_id: i64,
    token_id: i64,
) -> Result<Option<VerificationMethod>, ApiError> {
    let mut redis = app.redis().await?;
    let method: Option<String> = redis.get(method_key(user_id, token_id)).await?;
    Ok(method.as_deref().and_then(VerificationMethod::parse))
}

/// The key lives for the lifetime of the session's unverified state; the
/// session row itself expires in 24 h, so cap the key there too.
pub async fn set_method(
    app: &App,
    user_id: i64,
    token_id: i64,
    method: VerificationMethod,
) -> Result<(), ApiError> {
    let mut redis = app.redis().await?;
    redis
        .set_ex::<_, _, ()>(
            method_key(user_id, token_id),
            method.as_str(),
            verification::SESSION_LIFETIME_HOURS as u64 * 3600,
        )
        .await?;
    Ok(())
}

pub async fn clear_method(app: &App, user_id: i64, token_id: i64) -> Result<(), ApiError> {
    let mut redis = app.redis().await?;
    redis.del::<_, ()>(method_key(user_id, token_id)).await?;
    Ok(())
}

fn generate_email_code() -> String {
    let mut rng = rand::thread_rng();
    (0..EMAIL_CODE_DIGITS)
        .map(|_| char::from(b'0' + rng.gen_range(0..10)))
        .collect()
}

/// Issues (or re-uses) the outstanding 8-digit code and enqueues the
/// e-mail. One code per (user, e-mail) is outstanding at a time.
pub async fn send_verification_email(
    app: &App,
    user: &UserRow,
    ip_address: &str,
    user_agent: Option<&str>,
) -> Result<(), ApiError> {
    if !app.options.enable_email_verification {
        return Ok(());
    }
    let code = match verification::outstanding_email_code(&app.db, user.id).await? {
        Some(existing) => existing.verification_code,
        None => {
            let code = generate_email_code();
            let id = verification::create_email_code(
                &app.db,
                user.id,
                &user.email,
                &code,
                Some(ip_address),
                user_agent,
                chrono::Duration::seconds(EMAIL_CODE_TTL_SECS as i64),
            )
            .await?;
            let mut redis = app.redis().await?;
            redis
                .set_ex::<_, _, ()>(email_code_key(user.id, &code), id, EMAIL_CODE_TTL_SECS)
                .await?;
            code
        }
    };
    app.email
        .send_verification_code(&user.email, &user.username, &code);
    Ok(())
}

/// Redis points code -> row id for fast lookup; the row remains the
/// source of truth for used/expired state.
pub async fn verify_email_code(app: &App, user_id: i64, code: &str) -> Result<bool, ApiError> {
    if !app.options.enable_email_verification {
        return Ok(true);
    }
    let mut redis = app.redis().await?;
    let id: Option<i64> = redis.get(email_code_key(user_id, code)).await?;
    let Some(id) = id else {
        return Ok(false);
    };
    if !verification::consume_email_code(&app.db, id, user_id, code).await? {
        return Ok(false);
    }
    redis.del::<_, ()>(email_code_key(user_id, code)).await?;
    Ok(true)
}

/// Re-sends the code, limited to once per minute.
pub async fn resend_verification_email(
    app: &App,
    user: &UserRow,
    ip_address: &str,
    user_agent: Option<&str>,
) -> Result<bool, ApiError> {
    if !app.options.enable_email_verification {
        return Ok(true);
    }
    let mut redis = app.redis().await?;
    let limited: bool = redis.exists(email_rate_limit_key(user.id)).await?;
    if limited {
        return Ok(false);
    }
    redis
        .set_ex::<_, _, ()>(email_rate_limit_key(user.id), 1, EMAIL_RESEND_LIMIT_SECS)
        .await?;
    send_verification_email(app, user, ip_address, user_agent).await?;
    Ok(true)
}

pub async fn is_trusted_device(
    app: &App,
    user_id: i64,
    kind: ClientKind,
    ip_address: &str,
    web_uuid: Option<&str>,
) -> Result<bool, ApiError> {
    Ok(verification::trusted_device_exists(
        &app.db,
        user_id,
        kind.as_str(),
        Some(ip_address),
        web_uuid,
    )
    .await?)
}

/// Flips the session to verified, trusting the device and clearing the
/// chosen-method key.
pub async fn mark_session_verified(
    app: &App,
    user_id: i64,
    token_id: i64,
    kind: ClientKind,
    ip_address: &str,
    user_agent: Option<&str>,
    web_uuid: Option<&str>,
) -> Result<(), ApiError> {
    let device_id = if kind.is_game() || web_uuid.is_some() {
        Some(
            verification::upsert_trusted_device(
                &app.db,
                user_id,
                kind.as_str(),
                ip_address,
                user_agent,
                web_uuid,
                app.options.device_trust_days,
            )
            .await?,
        )
    } else {
        None
    };
    verification::mark_sessions_verified(&app.db, user_id, token_id, device_id).await?;
    clear_method(app, user_id, token_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_code_is_eight_digits() {
        for _ in 0..32 {
            let code = generate_email_code();
            assert_eq!(code.len(), EMAIL_CODE_DIGITS);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn method_parsing() {
        assert_eq!(VerificationMethod::parse("totp"), Some(VerificationMethod::Totp));
        assert_eq!(VerificationMethod::parse("mail"), Some(VerificationMethod::Mail));
        assert_eq!(VerificationMethod::parse("sms"), None);
    }
}
