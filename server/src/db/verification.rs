// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Login sessions, trusted devices, e-mail codes, TOTP keys and the login
//! attempt log.

use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, MySqlPool};

pub const SESSION_LIFETIME_HOURS: i64 = 24;

#[allow(clippy::too_many_arguments)]
pub async fn create_login_session(
    pool: &MySqlPool,
    user_id: i64,
    token_id: i64,
    ip_address: &str,
    user_agent: Option<&str>,
    is_new_device: bool,
    web_uuid: Option<&str>,
    is_verified: bool,
) -> Result<i64, sqlx::Error> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO login_sessions \
         (user_id, token_id, ip_address, user_agent, is_new_device, web_uuid, is_verified, \
          verified_at, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(token_id)
    .bind(ip_address)
    .bind(user_agent)
    .bind(is_new_device)
    .bind(web_uuid)
    .bind(is_verified)
    .bind(is_verified.then_some(now))
    .bind(now)
    .bind(now + Duration::hours(SESSION_LIFETIME_HOURS))
    .execute(pool)
    .await?;
    Ok(result.last_insert_id() as i64)
}

/// Whether the token still has an unverified, unexpired session.
pub async fn session_needs_verification(
    pool: &MySqlPool,
    user_id: i64,
    token_id: i64,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM login_sessions \
         WHERE user_id = ? AND token_id = ? AND is_verified = FALSE AND expires_at > ?",
    )
    .bind(user_id)
    .bind(token_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

pub async fn mark_sessions_verified(
    pool: &MySqlPool,
    user_id: i64,
    token_id: i64,
    device_id: Option<i64>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE login_sessions SET is_verified = TRUE, verified_at = ?, device_id = ? \
         WHERE user_id = ? AND token_id = ? AND is_verified = FALSE AND expires_at > ?",
    )
    .bind(Utc::now())
    .bind(device_id)
    .bind(user_id)
    .bind(token_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn trusted_device_exists(
    pool: &MySqlPool,
    user_id: i64,
    client_type: &str,
    ip_address: Option<&str>,
    web_uuid: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let count: i64 = match client_type {
        "client" => {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM trusted_devices \
                 WHERE user_id = ? AND client_type = 'client' AND ip_address = ? AND expires_at > ?",
            )
            .bind(user_id)
            .bind(ip_address)
            .bind(Utc::now())
            .fetch_one(pool)
            .await?
        }
        _ => {
            let Some(web_uuid) = web_uuid else {
                return Ok(false);
            };
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM trusted_devices \
                 WHERE user_id = ? AND client_type = 'web' AND web_uuid = ? AND expires_at > ?",
            )
            .bind(user_id)
            .bind(web_uuid)
            .bind(Utc::now())
            .fetch_one(pool)
            .await?
        }
    };
    Ok(count > 0)
}

/// Creates or refreshes the device row, extending its trust window.
pub async fn upsert_trusted_device(
    pool: &MySqlPool,
    user_id: i64,
    client_type: &str,
    ip_address: &str,
    user_agent: Option<&str>,
    web_uuid: Option<&str>,
    trust_days: i64,
) -> Result<i64, sqlx::Error> {
    let now = Utc::now();
    let expires_at = now + Duration::days(trust_days);
    let existing: Option<i64> = match client_type {
        "client" => {
            sqlx::query_scalar(
                "SELECT id FROM trusted_devices \
                 WHERE user_id = ? AND client_type = 'client' AND ip_address = ?",
            )
            .bind(user_id)
            .bind(ip_address)
            .fetch_optional(pool)
            .await?
        }
        _ => {
            sqlx::query_scalar(
                "SELECT id FROM trusted_devices \
                 WHERE user_id = ? AND client_type = 'web' AND web_uuid = ?",
            )
            .bind(user_id)
            .bind(web_uuid)
            .fetch_optional(pool)
            .await?
        }
    };
    if let Some(id) = existing {
        sqlx::query("UPDATE trusted_devices SET last_used_at = ?, expires_at = ? WHERE id = ?")
            .bind(now)
            .bind(expires_at)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(id)
    } else {
        let result = sqlx::query(
            "INSERT INTO trusted_devices \
             (user_id, client_type, ip_address, user_agent, web_uuid, last_used_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(client_type)
        .bind(ip_address)
        .bind(user_agent)
        .bind(web_uuid)
        .bind(now)
        .bind(expires_at)
        .execute(pool)
        .await?;
        Ok(result.last_insert_id() as i64)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EmailVerificationRow {
    pub id: i64,
    pub user_id: i64,
    pub verification_code: String,
    pub expires_at: DateTime<Utc>,
}

/// One outstanding code per (user, e-mail): a fresh request inside the
/// validity window returns the existing row.
pub async fn outstanding_email_code(
    pool: &MySqlPool,
    user_id: i64,
) -> Result<Option<EmailVerificationRow>, sqlx::Error> {
    sqlx::query_as::<_, EmailVerificationRow>(
        "SELECT id, user_id, verification_code, expires_at FROM email_verifications \
         WHERE user_id = ? AND is_used = FALSE AND expires_at > ?",
    )
    .bind(user_id)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await
}

pub async fn create_email_code(
    pool: &MySqlPool,
    user_id: i64,
    email: &str,
    code: &str,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
    lifetime: Duration,
) -> Result<i64, sqlx::Error> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO email_verifications \
         (user_id, email, verification_code, ip_address, user_agent, is_used, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, FALSE, ?, ?)",
    )
    .bind(user_id)
    .bind(email)
    .bind(code)
    .bind(ip_address)
    .bind(user_agent)
    .bind(now)
    .bind(now + lifetime)
    .execute(pool)
    .await?;
    Ok(result.last_insert_id() as i64)
}

/// Marks the code used if it is still valid. Returns whether a row matched.
pub async fn consume_email_code(
    pool: &MySqlPool,
    id: i64,
    user_id: i64,
    code: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE email_verifications SET is_used = TRUE, used_at = ? \
         WHERE id = ? AND user_id = ? AND verification_code = ? AND is_used = FALSE AND expires_at > ?",
    )
    .bind(Utc::now())
    .bind(id)
    .bind(user_id)
    .bind(code)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Clone, FromRow)]
pub struct TotpKeyRow {
    pub user_id: i64,
    pub secret: String,
    pub backup_keys: Json<Vec<String>>,
}

pub async fn totp_key(pool: &MySqlPool, user_id: i64) -> Result<Option<TotpKeyRow>, sqlx::Error> {
    sqlx::query_as::<_, TotpKeyRow>(
        "SELECT user_id, secret, backup_keys FROM totp_keys WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn insert_totp_key(
    pool: &MySqlPool,
    user_id: i64,
    secret: &str,
    backup_keys: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO totp_keys (user_id, secret, backup_keys, created_at) VALUES (?, ?, ?, ?)")
        .bind(user_id)
        .bind(secret)
        .bind(Json(backup_keys))
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_totp_key(pool: &MySqlPool, user_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM totp_keys WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Backup codes are single-use: rewrite the set without the spent one.
pub async fn update_backup_keys(
    pool: &MySqlPool,
    user_id: i64,
    backup_keys: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE totp_keys SET backup_keys = ? WHERE user_id = ?")
        .bind(Json(backup_keys))
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn record_login_attempt(
    pool: &MySqlPool,
    user_id: Option<i64>,
    attempted_username: Option<&str>,
    ip_address: &str,
    user_agent: Option<&str>,
    success: bool,
    method: &str,
    notes: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO login_logs \
         (user_id, attempted_username, ip_address, user_agent, success, method, notes, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(attempted_username)
    .bind(ip_address)
    .bind(user_agent)
    .bind(success)
    .bind(method)
    .bind(notes)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}
