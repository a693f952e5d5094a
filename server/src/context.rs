// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::app::App;
use crate::chat::ChatServer;
use crate::hub::Hub;
use crate::metadata::MetadataHub;
use crate::multiplayer::MultiplayerHub;
use crate::pipeline::MessageStore;
use crate::spectator::SpectatorHub;
use std::sync::Arc;

pub struct Hubs {
    pub multiplayer: Arc<MultiplayerHub>,
    pub spectator: Arc<SpectatorHub>,
    pub metadata: Arc<MetadataHub>,
}

impl Hubs {
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Hub>> {
        match name {
            "multiplayer" => Some(self.multiplayer.clone()),
            "spectator" => Some(self.spectator.clone()),
            "metadata" => Some(self.metadata.clone()),
            _ => None,
        }
    }
}

/// Everything the HTTP layer needs, owned once and shared.
pub struct Context {
    pub app: Arc<App>,
    pub hubs: Hubs,
    pub chat: Arc<ChatServer>,
    pub messages: Arc<MessageStore>,
}

impl Context {
    pub fn new(app: Arc<App>) -> Arc<Self> {
        let messages = Arc::new(MessageStore::new(app.clone()));
        let chat = Arc::new(ChatServer::new(app.clone(), messages.clone()));
        let multiplayer = Arc::new(MultiplayerHub::new(app.clone()));
        let spectator = Arc::new(SpectatorHub::new(app.clone()));
        let metadata = Arc::new(MetadataHub::new(app.clone()));
        multiplayer.wire(spectator.clone());
        Arc::new(Self {
            app,
            hubs: Hubs {
                multiplayer,
                spectator,
                metadata,
            },
            chat,
            messages,
        })
    }
}
