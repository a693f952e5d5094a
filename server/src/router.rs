// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Top-level route assembly.

use crate::context::Context;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn build(ctx: Arc<Context>) -> Router {
    Router::new()
        .merge(crate::auth::routes::router())
        .merge(crate::hub::router::router())
        .merge(crate::chat::routes::router())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
