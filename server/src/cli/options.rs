// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use clap::Parser;
use log::LevelFilter;
use std::time::Duration;

/// Server options, to be specified as arguments.
#[derive(Debug, Parser)]
pub struct Options {
    /// Log incoming HTTP requests.
    #[cfg_attr(debug_assertions, clap(long, default_value = "warn"))]
    #[cfg_attr(not(debug_assertions), clap(long, default_value = "error"))]
    pub debug_http: LevelFilter,
    /// Log hub diagnostics (multiplayer/spectator/metadata).
    #[cfg_attr(debug_assertions, clap(long, default_value = "info"))]
    #[cfg_attr(not(debug_assertions), clap(long, default_value = "warn"))]
    pub debug_hubs: LevelFilter,
    /// Log chat and message pipeline diagnostics.
    #[cfg_attr(debug_assertions, clap(long, default_value = "info"))]
    #[cfg_attr(not(debug_assertions), clap(long, default_value = "warn"))]
    pub debug_chat: LevelFilter,
    /// Log everything else.
    #[cfg_attr(debug_assertions, clap(long, default_value = "info"))]
    #[cfg_attr(not(debug_assertions), clap(long, default_value = "warn"))]
    pub debug_core: LevelFilter,
    #[clap(long, default_value = "8080")]
    pub http_port: u16,
    #[clap(long, default_value = "mysql://cadence@localhost/cadence")]
    pub database_url: String,
    #[clap(long, default_value = "redis://127.0.0.1")]
    pub redis_url: String,
    /// Secret used to sign access tokens.
    #[clap(long, default_value = "change-me")]
    pub jwt_secret: String,
    /// Game client credentials accepted without an oauth_clients row.
    #[clap(long, default_value = "5")]
    pub game_client_id: i64,
    #[clap(long, default_value = "")]
    pub game_client_secret: String,
    #[clap(long, default_value = "6")]
    pub web_client_id: i64,
    #[clap(long, default_value = "")]
    pub web_client_secret: String,
    /// Access token lifetime (minutes).
    #[clap(long, default_value = "1440")]
    pub access_token_expire_minutes: i64,
    /// Refresh token lifetime (minutes).
    #[clap(long, default_value = "43200")]
    pub refresh_token_expire_minutes: i64,
    /// How long a verified device bypasses the second factor (days).
    #[clap(long, default_value = "30")]
    pub device_trust_days: i64,
    #[clap(long, default_value = "true", action = clap::ArgAction::Set)]
    pub enable_totp_verification: bool,
    #[clap(long, default_value = "true", action = clap::ArgAction::Set)]
    pub enable_email_verification: bool,
    /// Keep older tokens alive when the same (user, client) signs in again.
    #[clap(long, default_value = "false", action = clap::ArgAction::Set)]
    pub enable_multi_device_login: bool,
    #[clap(long, default_value = "localhost")]
    pub smtp_host: String,
    #[clap(long, default_value = "")]
    pub smtp_username: String,
    #[clap(long, default_value = "")]
    pub smtp_password: String,
    #[clap(long, default_value = "cadence@localhost")]
    pub smtp_from: String,
    #[clap(long, default_value = "./replays")]
    pub replay_dir: String,
    /// Seconds between server pings on hub sockets.
    #[clap(long, default_value = "15")]
    pub signalr_ping_interval: u64,
    /// Seconds a negotiated connection may wait before opening its socket.
    #[clap(long, default_value = "30")]
    pub signalr_negotiate_timeout: u64,
    /// Login attempt rate limiting period (in seconds).
    #[clap(long, default_value = "10")]
    pub login_rate_limit: u64,
    /// Login attempt rate limiting burst.
    #[clap(long, default_value = "16")]
    pub login_burst: u32,
    /// Grace period announced to rooms on shutdown (seconds).
    #[clap(long, default_value = "30")]
    pub shutdown_grace_secs: u64,
}

impl Options {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.signalr_ping_interval)
    }

    pub fn negotiate_timeout(&self) -> Duration {
        Duration::from_secs(self.signalr_negotiate_timeout)
    }

    pub fn access_token_expire(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.access_token_expire_minutes)
    }

    pub fn refresh_token_expire(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.refresh_token_expire_minutes)
    }

    pub fn is_game_client(&self, client_id: i64, client_secret: &str) -> bool {
        (client_id == self.game_client_id && client_secret == self.game_client_secret)
            || (client_id == self.web_client_id && client_secret == self.web_client_secret)
    }
}
