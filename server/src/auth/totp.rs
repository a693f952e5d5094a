// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! TOTP verification with replay protection, backup codes, and the
//! enrollment draft held in Redis while the user proves possession of
//! their authenticator.

use crate::app::App;
use crate::db::verification::{self, TotpKeyRow};
use crate::error::ApiError;
use deadpool_redis::redis::AsyncCommands;
use rand::distributions::Alphanumeric;
use rand::Rng;
use totp_rs::{Algorithm, Secret, TOTP};

pub const TOTP_DIGITS: usize = 6;
pub const BACKUP_CODE_LENGTH: usize = 10;
pub const BACKUP_CODE_COUNT: usize = 10;
/// One TOTP time-step; the replay guard only needs to cover the window in
/// which a code remains valid.
pub const TOTP_STEP_SECS: u64 = 30;
const DRAFT_TTL_SECS: u64 = 300;
const DRAFT_MAX_FAILURES: i64 = 3;

fn replay_key(user_id: i64, code: &str) -> String {
    format!("totp_replay:{user_id}:{code}")
}

fn draft_key(user_id: i64) -> String {
    format!("totp:create:{user_id}")
}

fn build_totp(secret_base32: &str) -> Option<TOTP> {
    let secret = Secret::Encoded(secret_base32.to_owned()).to_bytes().ok()?;
    TOTP::new(Algorithm::SHA1, TOTP_DIGITS, 1, TOTP_STEP_SECS, secret).ok()
}

/// Checks a TOTP code and records it so that the same code is refused for
/// the rest of its time-step window.
pub async fn verify_totp_with_replay_protection(
    app: &App,
    user_id: i64,
    secret_base32: &str,
    code: &str,
) -> Result<bool, ApiError> {
    if code.len() != TOTP_DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
        return Ok(false);
    }
    let mut redis = app.redis().await?;
    let key = replay_key(user_id, code);
    let replayed: bool = redis.exists(&key).await?;
    if replayed {
        return Ok(false);
    }
    let Some(totp) = build_totp(secret_base32) else {
        log::error!("user {user_id} has an undecodable totp secret");
        return Ok(false);
    };
    if !totp.check_current(code).unwrap_or(false) {
        return Ok(false);
    }
    // Two time-steps: the checker accepts one step of clock skew.
    redis
        .set_ex::<_, _, ()>(&key, 1, TOTP_STEP_SECS * 2)
        .await?;
    Ok(true)
}

/// Backup codes are single-use; a match removes the code from the set.
pub async fn consume_backup_code(
    app: &App,
    totp_key: &TotpKeyRow,
    code: &str,
) -> Result<bool, ApiError> {
    if code.len() != BACKUP_CODE_LENGTH {
        return Ok(false);
    }
    let keys = &totp_key.backup_keys.0;
    if !keys.iter().any(|k| k == code) {
        return Ok(false);
    }
    let remaining: Vec<String> = keys.iter().filter(|k| *k != code).cloned().collect();
    verification::update_backup_keys(&app.db, totp_key.user_id, &remaining).await?;
    Ok(true)
}

fn generate_backup_codes() -> Vec<String> {
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            rand::thread_rng()
                .sample_iter(Alphanumeric)
                .take(BACKUP_CODE_LENGTH)
                .map(|c| (c as char).to_ascii_lowercase())
                .collect()
        })
        .collect()
}

pub fn provisioning_uri(secret_base32: &str, username: &str) -> String {
    format!("otpauth://totp/cadence:{username}?secret={secret_base32}&issuer=cadence")
}

/// Starts (or resumes) an enrollment draft. The secret only leaves Redis
/// once the user has finished the flow.
pub async fn start_enrollment(app: &App, user_id: i64) -> Result<String, ApiError> {
    let mut redis = app.redis().await?;
    let key = draft_key(user_id);
    let existing: Option<String> = redis.hget(&key, "secret").await?;
    if let Some(secret) = existing {
        return Ok(secret);
    }
    let secret = Secret::generate_secret().to_encoded().to_string();
    redis
        .hset_multiple::<_, _, _, ()>(&key, &[("secret", secret.as_str()), ("failures", "0")])
        .await?;
    redis.expire::<_, ()>(&key, DRAFT_TTL_SECS as i64).await?;
    Ok(secret)
}

pub enum EnrollmentOutcome {
    /// TOTP enabled; here are the user's backup codes.
    Enabled(Vec<String>),
    /// No draft in progress (expired or never started).
    NoDraft,
    /// Wrong code; the draft survives.
    BadCode,
    /// Third strike; the draft is discarded.
    TooManyAttempts,
}

pub async fn finish_enrollment(
    app: &App,
    user_id: i64,
    code: &str,
) -> Result<EnrollmentOutcome, ApiError> {
    let mut redis = app.redis().await?;
    let key = draft_key(user_id);
    let secret: Option<String> = redis.hget(&key, "secret").await?;
    let Some(secret) = secret else {
        return Ok(EnrollmentOutcome::NoDraft);
    };
    let valid = build_totp(&secret)
        .map(|totp| totp.check_current(code).unwrap_or(false))
        .unwrap_or(false);
    if !valid {
        let failures: i64 = redis.hincr(&key, "failures", 1).await?;
        if failures >= DRAFT_MAX_FAILURES {
            redis.del::<_, ()>(&key).await?;
            return Ok(EnrollmentOutcome::TooManyAttempts);
        }
        return Ok(EnrollmentOutcome::BadCode);
    }
    let backup_codes = generate_backup_codes();
    verification::insert_totp_key(&app.db, user_id, &secret, &backup_codes).await?;
    redis.del::<_, ()>(&key).await?;
    Ok(EnrollmentOutcome::Enabled(backup_codes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_codes_shape() {
        let codes = generate_backup_codes();
        assert_eq!(codes.len(), BACKUP_CODE_COUNT);
        for code in &codes {
            assert_eq!(code.len(), BACKUP_CODE_LENGTH);
            assert!(code.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn totp_accepts_current_code() {
        let secret = Secret::generate_secret().to_encoded().to_string();
        let totp = build_totp(&secret).unwrap();
        let code = totp.generate_current().unwrap();
        assert!(totp.check_current(&code).unwrap());
        assert_eq!(code.len(), TOTP_DIGITS);
    }
}
