// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::auth::password::BcryptCache;
use crate::cli::Options;
use crate::email::EmailQueue;
use crate::rate_limiter::IpRateLimiter;
use std::sync::Mutex;
use std::time::Duration;

/// Shared process-wide services handed down to every component.
pub struct App {
    pub options: Options,
    pub db: sqlx::MySqlPool,
    pub redis: deadpool_redis::Pool,
    pub email: EmailQueue,
    /// Limits credential attempts per IP.
    pub login_rate_limiter: Mutex<IpRateLimiter>,
    /// Short-circuits repeat bcrypt verifications; process-local by design.
    pub bcrypt_cache: BcryptCache,
}

impl App {
    pub async fn new(options: Options) -> Result<Self, Box<dyn std::error::Error>> {
        let db = crate::db::connect(&options.database_url).await?;
        let redis = deadpool_redis::Config::from_url(options.redis_url.as_str())
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
        let email = EmailQueue::spawn(&options);
        let login_rate_limiter = Mutex::new(IpRateLimiter::new(
            Duration::from_secs(options.login_rate_limit),
            options.login_burst,
        ));
        Ok(Self {
            options,
            db,
            redis,
            email,
            login_rate_limiter,
            bcrypt_cache: BcryptCache::default(),
        })
    }

    pub async fn redis(
        &self,
    ) -> Result<deadpool_redis::Connection, deadpool_redis::PoolError> {
        self.redis.get().await
    }
}
