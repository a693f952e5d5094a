// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The OAuth token endpoint and the second-factor session verification
//! surface.

use super::password::authenticate_user;
use super::tokens::{authenticate_bearer, create_access_token, generate_refresh_token};
use super::totp::{
    consume_backup_code, finish_enrollment, provisioning_uri, start_enrollment,
    verify_totp_with_replay_protection, EnrollmentOutcome, BACKUP_CODE_LENGTH, TOTP_DIGITS,
};
use super::verification::{self, VerificationMethod};
use super::TOTP_VERIFICATION_MIN_API_VERSION;
use crate::app::App;
use crate::context::Context;
use crate::db::users::BOT_USER_ID;
use crate::db::{tokens, users, verification as verification_db};
use crate::error::ApiError;
use crate::user_agent::classify_user_agent;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Form, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

pub fn router() -> Router<Arc<Context>> {
    Router::new()
        .route("/oauth/token", post(oauth_token))
        // The client historically reaches these both bare and under /api/v2.
        .route("/session/verify", post(session_verify))
        .route("/api/v2/session/verify", post(session_verify))
        .route("/session/verify/reissue", post(session_reissue))
        .route("/api/v2/session/verify/reissue", post(session_reissue))
        .route("/session/verify/mail-fallback", post(mail_fallback))
        .route("/api/v2/session/verify/mail-fallback", post(mail_fallback))
        .route("/api/private/totp/status", get(totp_status))
        .route("/api/private/totp/create", post(totp_create).put(totp_finish))
        .route("/api/private/totp", delete(totp_disable))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    grant_type: String,
    client_id: i64,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default = "default_scope")]
    scope: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn default_scope() -> String {
    "*".to_owned()
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
    refresh_token: String,
    scope: String,
}

/// The standard OAuth 2 error envelope.
fn oauth_error(status: StatusCode, error: &str, description: &str, hint: &str) -> Response {
    (
        status,
        Json(json!({
            "error": error,
            "error_description": description,
            "hint": hint,
            "message": description,
        })),
    )
        .into_response()
}

fn invalid_request(hint: &str) -> Response {
    oauth_error(
        StatusCode::BAD_REQUEST,
        "invalid_request",
        "The request is missing a required parameter, includes an invalid parameter value, \
         includes a parameter more than once, or is otherwise malformed.",
        hint,
    )
}

fn invalid_grant(hint: &str) -> Response {
    oauth_error(
        StatusCode::BAD_REQUEST,
        "invalid_grant",
        "The provided authorization grant (e.g., authorization code, resource owner credentials) \
         or refresh token is invalid, expired, revoked, does not match the redirection URI used \
         in the authorization request, or was issued to another client.",
        hint,
    )
}

fn invalid_client() -> Response {
    oauth_error(
        StatusCode::UNAUTHORIZED,
        "invalid_client",
        "Client authentication failed (e.g., unknown client, no client authentication included, \
         or unsupported authentication method).",
        "Invalid client credentials",
    )
}

fn invalid_scope(hint: &str) -> Response {
    oauth_error(
        StatusCode::BAD_REQUEST,
        "invalid_scope",
        "The requested scope is invalid, unknown, or malformed.",
        hint,
    )
}

struct RequestMeta<'a> {
    ip: String,
    user_agent: &'a str,
    web_uuid: Option<&'a str>,
    api_version: i32,
}

fn request_meta<'a>(addr: &SocketAddr, headers: &'a HeaderMap) -> RequestMeta<'a> {
    RequestMeta {
        ip: addr.ip().to_string(),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(""),
        web_uuid: headers.get("x-uuid").and_then(|v| v.to_str().ok()),
        api_version: headers
            .get("x-api-version")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    }
}

struct IssuedTokens {
    row: tokens::TokenRow,
    response: TokenResponse,
}

async fn issue_tokens(
    app: &App,
    user_id: i64,
    client_id: i64,
    scopes: &[&str],
) -> Result<IssuedTokens, ApiError> {
    let access_token = create_access_token(app, user_id);
    let refresh_token = generate_refresh_token();
    let now = Utc::now();
    let row = tokens::store_token(
        &app.db,
        user_id,
        client_id,
        scopes,
        &access_token,
        &refresh_token,
        now + app.options.access_token_expire(),
        now + app.options.refresh_token_expire(),
        app.options.enable_multi_device_login,
    )
    .await?;
    Ok(IssuedTokens {
        row,
        response: TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_in: app.options.access_token_expire_minutes * 60,
            refresh_token,
            scope: scopes.join(" "),
        },
    })
}

async fn oauth_token(
    State(ctx): State<Arc<Context>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let meta = request_meta(&addr, &headers);
    let scopes: Vec<&str> = request.scope.split(' ').filter(|s| !s.is_empty()).collect();

    let known_client =
        tokens::client_credentials_valid(&app.db, request.client_id, &request.client_secret)
            .await?;
    let is_game_client = app
        .options
        .is_game_client(request.client_id, &request.client_secret);
    if !known_client && !is_game_client {
        return Ok(invalid_client());
    }

    match request.grant_type.as_str() {
        "password" => {
            password_grant(app, &request, &meta, &scopes).await
        }
        "refresh_token" => {
            let Some(refresh_token) = request.refresh_token.as_deref() else {
                return Ok(invalid_request("Refresh token required"));
            };
            let Some(record) = tokens::by_refresh_token(&app.db, refresh_token).await? else {
                return Ok(invalid_grant("Invalid refresh token"));
            };
            let scopes = record.scopes();
            let issued = issue_tokens(app, record.user_id, request.client_id, &scopes).await?;
            Ok(Json(issued.response).into_response())
        }
        "authorization_code" => {
            if !known_client {
                return Ok(invalid_client());
            }
            let Some(code) = request.code.as_deref() else {
                return Ok(invalid_request("Authorization code required"));
            };
            let Some((user_id, scopes)) =
                super::consume_authorization_code(app, request.client_id, code).await?
            else {
                return Ok(invalid_grant("Invalid authorization code"));
            };
            if users::by_id(&app.db, user_id).await?.is_none() {
                return Ok(invalid_grant("Invalid authorization code"));
            }
            let scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
            let issued = issue_tokens(app, user_id, request.client_id, &scopes).await?;
            Ok(Json(issued.response).into_response())
        }
        "client_credentials" => {
            if !known_client {
                return Ok(invalid_client());
            }
            if scopes != ["public"] {
                return Ok(invalid_scope("Scope must be 'public'"));
            }
            let issued = issue_tokens(app, BOT_USER_ID, request.client_id, &["public"]).await?;
            Ok(Json(issued.response).into_response())
        }
        _ => Ok(invalid_request("Unsupported grant type")),
    }
}

async fn password_grant(
    app: &App,
    request: &TokenRequest,
    meta: &RequestMeta<'_>,
    scopes: &[&str],
) -> Result<Response, ApiError> {
    let (Some(username), Some(password)) =
        (request.username.as_deref(), request.password.as_deref())
    else {
        return Ok(invalid_request("Username and password required"));
    };
    if scopes != ["*"] {
        return Ok(invalid_scope("Only '*' scope is allowed for password grant type"));
    }
    if let Ok(ip) = meta.ip.parse() {
        if app.login_rate_limiter.lock().unwrap().should_limit_rate(ip) {
            return Ok(invalid_request("Too many attempts, slow down"));
        }
    }

    let Some(user) = authenticate_user(&app.db, &app.bcrypt_cache, username, password).await?
    else {
        verification_db::record_login_attempt(
            &app.db,
            None,
            Some(username),
            &meta.ip,
            Some(meta.user_agent),
            false,
            "password",
            "Invalid credentials",
        )
        .await?;
        return Ok(invalid_grant("Incorrect sign in"));
    };

    let issued = issue_tokens(app, user.id, request.client_id, &["*"]).await?;
    let token_id = issued.row.id;

    let kind = classify_user_agent(meta.user_agent);
    let totp_key = verification_db::totp_key(&app.db, user.id).await?;
    let trusted =
        verification::is_trusted_device(app, user.id, kind, &meta.ip, meta.web_uuid).await?;

    let method = if meta.api_version >= TOTP_VERIFICATION_MIN_API_VERSION
        && app.options.enable_totp_verification
        && totp_key.is_some()
    {
        Some(VerificationMethod::Totp)
    } else if !trusted && app.options.enable_email_verification {
        Some(VerificationMethod::Mail)
    } else {
        None
    };

    match method {
        Some(method) => {
            if method == VerificationMethod::Mail {
                verification::send_verification_email(
                    app,
                    &user,
                    &meta.ip,
                    Some(meta.user_agent),
                )
                .await?;
            }
            verification_db::create_login_session(
                &app.db,
                user.id,
                token_id,
                &meta.ip,
                Some(meta.user_agent),
                !trusted,
                meta.web_uuid,
                false,
            )
            .await?;
            verification::set_method(app, user.id, token_id, method).await?;
            verification_db::record_login_attempt(
                &app.db,
                Some(user.id),
                None,
                &meta.ip,
                Some(meta.user_agent),
                true,
                "password_pending_verification",
                method.as_str(),
            )
            .await?;
        }
        None => {
            verification_db::create_login_session(
                &app.db,
                user.id,
                token_id,
                &meta.ip,
                Some(meta.user_agent),
                !trusted,
                meta.web_uuid,
                true,
            )
            .await?;
            if !trusted && (kind.is_game() || meta.web_uuid.is_some()) {
                verification_db::upsert_trusted_device(
                    &app.db,
                    user.id,
                    kind.as_str(),
                    &meta.ip,
                    Some(meta.user_agent),
                    meta.web_uuid,
                    app.options.device_trust_days,
                )
                .await?;
            }
            verification_db::record_login_attempt(
                &app.db,
                Some(user.id),
                None,
                &meta.ip,
                Some(meta.user_agent),
                true,
                "password",
                "",
            )
            .await?;
        }
    }

    Ok(Json(issued.response).into_response())
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    verification_key: String,
}

enum VerifyFailure {
    Plain(String),
    WithReason(String, &'static str),
}

async fn session_verify(
    State(ctx): State<Arc<Context>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(request): Form<VerifyRequest>,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let meta = request_meta(&addr, &headers);
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (user, token) = authenticate_bearer(app, authorization).await?;

    if !verification_db::session_needs_verification(&app.db, user.id, token.id).await? {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let mut method = if meta.api_version < TOTP_VERIFICATION_MIN_API_VERSION {
        VerificationMethod::Mail
    } else {
        match verification::chosen_method(app, user.id, token.id).await? {
            Some(method) => method,
            None => {
                let totp_key = verification_db::totp_key(&app.db, user.id).await?;
                let method = if totp_key.is_some() {
                    VerificationMethod::Totp
                } else {
                    VerificationMethod::Mail
                };
                verification::set_method(app, user.id, token.id, method).await?;
                method
            }
        }
    };

    let key = request.verification_key.trim();
    let mut login_method = method.as_str();
    let failure = match method {
        VerificationMethod::Totp => {
            match verification_db::totp_key(&app.db, user.id).await? {
                None => {
                    // The key was removed between method selection and now;
                    // fall back to mail if that is available.
                    if app.options.enable_email_verification {
                        verification::set_method(app, user.id, token.id, VerificationMethod::Mail)
                            .await?;
                        verification::send_verification_email(
                            app,
                            &user,
                            &meta.ip,
                            Some(meta.user_agent),
                        )
                        .await?;
                        method = VerificationMethod::Mail;
                        Some(VerifyFailure::Plain(
                            "TOTP is no longer enabled; a verification code was emailed".to_owned(),
                        ))
                    } else {
                        None
                    }
                }
                Some(totp_key) => {
                    if verify_totp_with_replay_protection(app, user.id, &totp_key.secret, key)
                        .await?
                    {
                        None
                    } else if key.len() == BACKUP_CODE_LENGTH
                        && consume_backup_code(app, &totp_key, key).await?
                    {
                        login_method = "totp_backup_code";
                        None
                    } else if key.len() != TOTP_DIGITS {
                        Some(VerifyFailure::WithReason(
                            "verification code should be 6 digits".to_owned(),
                            "incorrect_length",
                        ))
                    } else if !key.chars().all(|c| c.is_ascii_digit()) {
                        Some(VerifyFailure::WithReason(
                            "verification code should be numeric".to_owned(),
                            "incorrect_format",
                        ))
                    } else {
                        Some(VerifyFailure::WithReason(
                            "incorrect or expired verification code".to_owned(),
                            "incorrect_key",
                        ))
                    }
                }
            }
        }
        VerificationMethod::Mail => {
            if verification::verify_email_code(app, user.id, key).await? {
                None
            } else {
                Some(VerifyFailure::Plain(
                    "incorrect or expired verification code".to_owned(),
                ))
            }
        }
    };

    match failure {
        None => {
            verification_db::record_login_attempt(
                &app.db,
                Some(user.id),
                None,
                &meta.ip,
                Some(meta.user_agent),
                true,
                login_method,
                "",
            )
            .await?;
            verification::mark_session_verified(
                app,
                user.id,
                token.id,
                classify_user_agent(meta.user_agent),
                &meta.ip,
                Some(meta.user_agent),
                meta.web_uuid,
            )
            .await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Some(failure) => {
            let (error, reason) = match failure {
                VerifyFailure::Plain(error) => (error, None),
                VerifyFailure::WithReason(error, reason) => (error, Some(reason)),
            };
            verification_db::record_login_attempt(
                &app.db,
                Some(user.id),
                Some(&user.username),
                &meta.ip,
                Some(meta.user_agent),
                false,
                login_method,
                &error,
            )
            .await?;
            let mut body = json!({
                "error": error,
                "method": method.as_str(),
            });
            if let Some(reason) = reason {
                body["reason"] = json!(reason);
            }
            Ok((StatusCode::UNAUTHORIZED, Json(body)).into_response())
        }
    }
}

async fn session_reissue(
    State(ctx): State<Arc<Context>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let meta = request_meta(&addr, &headers);
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (user, token) = authenticate_bearer(app, authorization).await?;

    if !verification_db::session_needs_verification(&app.db, user.id, token.id).await? {
        return Ok(Json(json!({ "success": false, "message": "session is already verified" }))
            .into_response());
    }
    let method = if meta.api_version < TOTP_VERIFICATION_MIN_API_VERSION {
        Some(VerificationMethod::Mail)
    } else {
        verification::chosen_method(app, user.id, token.id).await?
    };
    if method != Some(VerificationMethod::Mail) {
        return Ok(Json(
            json!({ "success": false, "message": "session does not use mail verification" }),
        )
        .into_response());
    }
    let sent =
        verification::resend_verification_email(app, &user, &meta.ip, Some(meta.user_agent))
            .await?;
    let message = if sent {
        "verification code sent"
    } else {
        "wait before requesting another code"
    };
    Ok(Json(json!({ "success": sent, "message": message })).into_response())
}

/// Switches an awaiting-TOTP session over to mail verification.
async fn mail_fallback(
    State(ctx): State<Arc<Context>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let meta = request_meta(&addr, &headers);
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (user, token) = authenticate_bearer(app, authorization).await?;

    if verification::chosen_method(app, user.id, token.id).await?.is_none() {
        return Err(ApiError::BadRequest("session does not need verification".to_owned()));
    }
    verification::set_method(app, user.id, token.id, VerificationMethod::Mail).await?;
    verification::resend_verification_email(app, &user, &meta.ip, Some(meta.user_agent)).await?;
    Ok(Json(json!({ "method": "mail" })).into_response())
}

async fn totp_status(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (user, _) = authenticate_bearer(app, authorization).await?;
    let enabled = verification_db::totp_key(&app.db, user.id).await?.is_some();
    Ok(Json(json!({ "enabled": enabled })).into_response())
}

async fn totp_create(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (user, _) = authenticate_bearer(app, authorization).await?;
    if verification_db::totp_key(&app.db, user.id).await?.is_some() {
        return Err(ApiError::BadRequest("TOTP is already enabled for this user".to_owned()));
    }
    let secret = start_enrollment(app, user.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "secret": secret,
            "uri": provisioning_uri(&secret, &user.username),
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct TotpCodeRequest {
    code: String,
}

async fn totp_finish(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    Json(request): Json<TotpCodeRequest>,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (user, _) = authenticate_bearer(app, authorization).await?;
    match finish_enrollment(app, user.id, request.code.trim()).await? {
        EnrollmentOutcome::Enabled(backup_codes) => {
            Ok((StatusCode::CREATED, Json(backup_codes)).into_response())
        }
        EnrollmentOutcome::NoDraft => Err(ApiError::BadRequest(
            "no TOTP setup in progress or invalid data".to_owned(),
        )),
        EnrollmentOutcome::BadCode => Err(ApiError::BadRequest("invalid TOTP code".to_owned())),
        EnrollmentOutcome::TooManyAttempts => {
            Err(ApiError::BadRequest("too_many_attempts".to_owned()))
        }
    }
}

async fn totp_disable(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    Json(request): Json<TotpCodeRequest>,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (user, _) = authenticate_bearer(app, authorization).await?;
    let Some(totp_key) = verification_db::totp_key(&app.db, user.id).await? else {
        return Err(ApiError::BadRequest("TOTP is not enabled for this user".to_owned()));
    };
    let code = request.code.trim();
    let valid = if code.len() == TOTP_DIGITS {
        verify_totp_with_replay_protection(app, user.id, &totp_key.secret, code).await?
    } else {
        consume_backup_code(app, &totp_key, code).await?
    };
    if !valid {
        return Err(ApiError::BadRequest("invalid TOTP code or backup code".to_owned()));
    }
    verification_db::delete_totp_key(&app.db, user.id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
