// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Channel membership, message delivery, notifications and the resident
//! bot.

pub mod bot;
pub mod routes;
mod server;

pub use server::{channel_message_receivers, user_resp, ChatEvent, ChatServer, DEFAULT_CHANNEL_ID};
