// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

/// Device trust keys on what kind of client is signing in: the game
/// client is fingerprinted by IP, web clients by their persisted UUID.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientKind {
    Game,
    Web,
}

impl ClientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Game => "client",
            Self::Web => "web",
        }
    }

    pub fn is_game(self) -> bool {
        self == Self::Game
    }
}

/// Identifiers that mark a user agent as the game client or a client
/// built on its framework.
const GAME_CLIENT_IDENTIFIERS: &[&str] = &["osu!", "osu!lazer", "osu-framework"];

/// Bucketize a user agent. Game clients advertise one of a few known
/// identifiers anywhere in the agent string, in any case; everything
/// else is treated as a browser.
pub fn classify_user_agent(s: &str) -> ClientKind {
    let lower = s.to_ascii_lowercase();
    if GAME_CLIENT_IDENTIFIERS
        .iter()
        .any(|identifier| lower.contains(identifier))
    {
        ClientKind::Game
    } else {
        ClientKind::Web
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_user_agent, ClientKind};

    #[test]
    fn test_classify_user_agent() {
        let tests = [
            ("osu!", ClientKind::Game),
            ("osu! 2025.101.0 (lazer)", ClientKind::Game),
            ("OSU!LAZER 2025.101.0", ClientKind::Game),
            ("Mozilla/5.0 (compatible) osu-framework", ClientKind::Game),
            ("SomeLauncher osu! wrapper", ClientKind::Game),
            (
                "Mozilla/5.0 (Windows NT 10.0; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/51.0.2704.103 Safari/537.36",
                ClientKind::Web,
            ),
            ("", ClientKind::Web),
        ];

        for (user_agent, correct_kind) in tests {
            assert_eq!(classify_user_agent(user_agent), correct_kind);
        }
    }
}
