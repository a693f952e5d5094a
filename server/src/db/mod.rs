// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable storage. Row types mirror the schema; queries are plain sqlx
//! with runtime binding.

pub mod chat;
pub mod rooms;
pub mod scores;
pub mod tokens;
pub mod users;
pub mod verification;

use sqlx::mysql::MySqlPoolOptions;
pub use sqlx::MySqlPool;

pub async fn connect(url: &str) -> Result<MySqlPool, sqlx::Error> {
    MySqlPoolOptions::new()
        .max_connections(16)
        .connect(url)
        .await
}
