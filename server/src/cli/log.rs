// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use super::Options;
use log::{LevelFilter, Log};
use std::cell::RefCell;
use std::fmt::Write as _;
use std::io::{stderr, Write as _};

impl Options {
    pub fn init_logger(&self) {
        log::set_boxed_logger(Box::new(Logger {
            http: self.debug_http,
            hubs: self.debug_hubs,
            chat: self.debug_chat,
            core: self.debug_core,
        }))
        .expect("failed to init logger");
        log::set_max_level(
            self.debug_http
                .max(self.debug_hubs)
                .max(self.debug_chat)
                .max(self.debug_core),
        );
    }
}

struct Logger {
    http: LevelFilter,
    hubs: LevelFilter,
    chat: LevelFilter,
    core: LevelFilter,
}

impl Logger {
    fn filter(&self, target: &str) -> LevelFilter {
        if target.starts_with("cadence_server::hub")
            || target.starts_with("cadence_server::multiplayer")
            || target.starts_with("cadence_server::spectator")
            || target.starts_with("cadence_server::metadata")
        {
            self.hubs
        } else if target.starts_with("cadence_server::chat")
            || target.starts_with("cadence_server::pipeline")
        {
            self.chat
        } else if target.starts_with("cadence_server::auth")
            || target.starts_with("cadence_server::router")
            || target.starts_with("tower_http")
        {
            self.http
        } else {
            self.core
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.filter(metadata.target()) >= metadata.level()
    }

    fn flush(&self) {
        // No-op
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        thread_local! {
            static BUFFER: RefCell<String> = const { RefCell::new(String::new()) };
        }
        BUFFER.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();
            writeln!(
                &mut *buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
            .unwrap();
            let result = stderr().lock().write_all(buf.as_bytes());
            if cfg!(debug_assertions) {
                result.unwrap();
            }
        });
    }
}
