// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Graceful shutdown: announce a server-shutdown countdown to every
//! room, flush the message pipeline, then let the process exit.

use crate::context::Context;
use std::sync::Arc;
use std::time::Duration;

/// Resolves when the process should stop accepting connections.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

pub async fn drain(ctx: &Arc<Context>) {
    let grace = Duration::from_secs(ctx.app.options.shutdown_grace_secs);
    log::info!("shutting down: announcing {}s grace to rooms", grace.as_secs());
    ctx.hubs.multiplayer.announce_shutdown(grace).await;
    tokio::time::sleep(grace).await;
    if let Err(e) = ctx.messages.flush().await {
        log::error!("failed to flush pending messages: {e}");
    }
    log::info!("shutdown complete");
}
