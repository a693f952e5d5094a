// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Legacy password verification: the stored hash is bcrypt over the md5
//! hex of the plaintext. A bounded in-process cache keyed by bcrypt hash
//! short-circuits repeat verifications, since bcrypt dominates sign-in
//! latency.

use crate::db::users::{self, UserRow};
use md5::{Digest, Md5};
use sqlx::MySqlPool;
use std::collections::HashMap;
use std::sync::Mutex;

const CACHE_CAPACITY: usize = 1024;

#[derive(Default)]
pub struct BcryptCache {
    /// bcrypt hash -> md5 hex that last verified against it.
    map: Mutex<HashMap<String, String>>,
}

impl BcryptCache {
    fn get(&self, bcrypt_hash: &str) -> Option<String> {
        self.map.lock().unwrap().get(bcrypt_hash).cloned()
    }

    fn insert(&self, bcrypt_hash: &str, md5_hex: &str) {
        let mut map = self.map.lock().unwrap();
        if map.len() >= CACHE_CAPACITY {
            // Password churn is rare; dropping the whole map beats tracking
            // recency for a cache this cheap to refill.
            map.clear();
        }
        map.insert(bcrypt_hash.to_owned(), md5_hex.to_owned());
    }
}

pub fn md5_hex(plaintext: &str) -> String {
    hex::encode(Md5::digest(plaintext.as_bytes()))
}

/// Legacy path first (bcrypt over md5), plain bcrypt as interop fallback.
pub fn verify_password(cache: &BcryptCache, plaintext: &str, bcrypt_hash: &str) -> bool {
    let md5 = md5_hex(plaintext);
    if let Some(cached) = cache.get(bcrypt_hash) {
        return cached == md5;
    }
    match bcrypt::verify(&md5, bcrypt_hash) {
        Ok(true) => {
            cache.insert(bcrypt_hash, &md5);
            return true;
        }
        Ok(false) => {}
        Err(e) => {
            log::warn!("malformed password hash: {e}");
            return false;
        }
    }
    bcrypt::verify(plaintext, bcrypt_hash).unwrap_or(false)
}

pub fn hash_password(plaintext: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(md5_hex(plaintext), bcrypt::DEFAULT_COST)
}

/// Looks the user up by username, then e-mail, then numeric id (in that
/// order, to avoid id-collision lookups shadowing names), and verifies
/// the password.
pub async fn authenticate_user(
    pool: &MySqlPool,
    cache: &BcryptCache,
    name: &str,
    password: &str,
) -> Result<Option<UserRow>, sqlx::Error> {
    let mut user = users::by_username(pool, name).await?;
    if user.is_none() {
        user = users::by_email(pool, name).await?;
    }
    if user.is_none() {
        if let Ok(id) = name.parse::<i64>() {
            user = users::by_id(pool, id).await?;
        }
    }
    let Some(user) = user else {
        return Ok(None);
    };
    let Some(bcrypt_hash) = user.pw_bcrypt.as_deref().filter(|h| !h.is_empty()) else {
        return Ok(None);
    };
    Ok(verify_password(cache, password, bcrypt_hash).then_some(user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_scheme_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        let cache = BcryptCache::default();
        assert!(verify_password(&cache, "correct horse", &hash));
        assert!(!verify_password(&cache, "wrong horse", &hash));
        // Second verification hits the cache.
        assert!(verify_password(&cache, "correct horse", &hash));
    }

    #[test]
    fn plain_bcrypt_fallback() {
        // A hash produced over the raw plaintext rather than its md5.
        let hash = bcrypt::hash("correct horse", 4).unwrap();
        let cache = BcryptCache::default();
        assert!(verify_password(&cache, "correct horse", &hash));
        assert!(!verify_password(&cache, "wrong horse", &hash));
    }

    #[test]
    fn md5_is_lowercase_hex() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn cache_differentiates_passwords() {
        let hash = hash_password("first").unwrap();
        let cache = BcryptCache::default();
        assert!(verify_password(&cache, "first", &hash));
        // Cached entry must not make a different password pass.
        assert!(!verify_password(&cache, "second", &hash));
    }
}
