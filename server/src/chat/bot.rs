// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The resident bot. Commands arrive as `!name args` chat messages;
//! replies to commands issued in public channels are redirected to a PM
//! channel so they do not spam the room.

use super::server::{ChatServer, require_user};
use crate::db::chat::{self, ChannelRow, ChannelType};
use crate::db::users::{UserRow, BOT_USER_ID};
use crate::db::scores;
use crate::error::ApiError;
use rand::Rng;

pub struct Bot {
    bot_user_id: i64,
}

impl Default for Bot {
    fn default() -> Self {
        Self {
            bot_user_id: BOT_USER_ID,
        }
    }
}

impl Bot {
    /// Splits `!cmd arg arg` into its parts; None when the content is not
    /// a command.
    pub fn parse(content: &str) -> Option<(String, Vec<String>)> {
        let stripped = content.strip_prefix('!')?;
        let mut parts = stripped.split_whitespace();
        let command = parts.next()?.to_ascii_lowercase();
        Some((command, parts.map(str::to_owned).collect()))
    }

    pub async fn try_handle(
        &self,
        server: &ChatServer,
        sender: &UserRow,
        channel: &ChannelRow,
        content: &str,
    ) -> Result<(), ApiError> {
        let Some((command, args)) = Self::parse(content) else {
            return Ok(());
        };
        let reply = match command.as_str() {
            "help" => Some(
                "Available commands: !help, !roll [max], !stats [user], !pr, !re".to_owned(),
            ),
            "roll" => {
                let max: u64 = args
                    .first()
                    .and_then(|a| a.parse().ok())
                    .filter(|&max| max > 0)
                    .unwrap_or(100);
                let rolled = rand::thread_rng().gen_range(1..=max);
                Some(format!("{} rolls {rolled} point(s)", sender.username))
            }
            "stats" => self.stats_reply(server, sender, &args).await?,
            "pr" => self.score_reply(server, sender, true).await?,
            "re" => self.score_reply(server, sender, false).await?,
            _ => None,
        };
        if let Some(reply) = reply {
            self.send_reply(server, sender, channel, &reply).await?;
        }
        Ok(())
    }

    async fn stats_reply(
        &self,
        server: &ChatServer,
        sender: &UserRow,
        args: &[String],
    ) -> Result<Option<String>, ApiError> {
        let target = match args.first() {
            Some(name) => match crate::db::users::by_username(&server.app.db, name).await? {
                Some(user) => user,
                None => return Ok(Some(format!("User {name} not found"))),
            },
            None => sender.clone(),
        };
        let statistics =
            scores::user_statistics(&server.app.db, target.id, target.playmode).await?;
        Ok(Some(match statistics {
            Some(statistics) => format!(
                "Stats for {}: {:.0}pp, {:.2}% accuracy, {} plays",
                target.username,
                statistics.pp,
                statistics.hit_accuracy,
                statistics.play_count
            ),
            None => format!("No stats recorded for {}", target.username),
        }))
    }

    async fn score_reply(
        &self,
        server: &ChatServer,
        sender: &UserRow,
        passed_only: bool,
    ) -> Result<Option<String>, ApiError> {
        let score = if passed_only {
            scores::recent_passed_score(&server.app.db, sender.id).await?
        } else {
            scores::recent_score(&server.app.db, sender.id).await?
        };
        Ok(Some(match score {
            Some(score) => format!(
                "{}'s recent score: {} on beatmap {} ({} rank, {:.0}pp)",
                sender.username, score.total_score, score.beatmap_id, score.rank, score.pp
            ),
            None => "No recent score found".to_owned(),
        }))
    }

    /// Public-channel commands are answered in a PM channel with the bot;
    /// everywhere else the reply lands where the command was issued.
    async fn send_reply(
        &self,
        server: &ChatServer,
        sender: &UserRow,
        src_channel: &ChannelRow,
        reply: &str,
    ) -> Result<(), ApiError> {
        let channel = if src_channel.kind() == ChannelType::Public {
            let pm = chat::get_or_create_pm_channel(&server.app.db, sender.id, self.bot_user_id)
                .await?;
            server.join_channel(sender.id, &pm).await?;
            server.join_channel(self.bot_user_id, &pm).await?;
            pm
        } else {
            src_channel.clone()
        };
        let bot = require_user(&server.app, self.bot_user_id).await?;
        let is_multiplayer = channel.kind() == ChannelType::Multiplayer;
        let message = server
            .store
            .send_message(channel.channel_id, bot.id, reply, false, None, is_multiplayer)
            .await?;
        server.deliver_message(&message, &bot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Bot;

    #[test]
    fn command_parsing() {
        assert_eq!(
            Bot::parse("!roll 500"),
            Some(("roll".to_owned(), vec!["500".to_owned()]))
        );
        assert_eq!(Bot::parse("!HELP"), Some(("help".to_owned(), vec![])));
        assert_eq!(Bot::parse("hello there"), None);
        assert_eq!(Bot::parse("!"), None);
    }
}
