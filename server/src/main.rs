// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use cadence_server::app::App;
use cadence_server::cli::Options;
use cadence_server::context::Context;
use cadence_server::{router, shutdown, subscriber};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let options = Options::parse();
    options.init_logger();

    let app = match App::new(options).await {
        Ok(app) => Arc::new(app),
        Err(e) => {
            log::error!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    let ctx = Context::new(app);

    if let Err(e) = ctx.messages.startup().await {
        log::error!("message pipeline startup failed: {e}");
        std::process::exit(1);
    }
    tokio::spawn(ctx.messages.clone().run_persister());
    subscriber::spawn(ctx.clone());

    let port = ctx.app.options.http_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    log::info!("listening on {addr}");

    let service = router::build(ctx.clone())
        .into_make_service_with_connect_info::<SocketAddr>();
    let server = axum::serve(listener, service);
    let shutdown_ctx = ctx.clone();
    let result = server
        .with_graceful_shutdown(async move {
            shutdown::wait_for_signal().await;
            shutdown::drain(&shutdown_ctx).await;
        })
        .await;
    if let Err(e) = result {
        log::error!("server error: {e}");
    }
}
