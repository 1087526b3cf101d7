pub mod websocket;

use crate::agent::ConversationOrchestrator;
use crate::settings::ChatSettings;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    addr: String,
    engine: Arc<ConversationOrchestrator>,
    settings: Arc<ChatSettings>,
    api_key: Option<String>,
}

impl Server {
    pub fn new(
        addr: String,
        engine: Arc<ConversationOrchestrator>,
        settings: Arc<ChatSettings>,
        api_key: Option<String>
    ) -> Self {
        Self {
            addr,
            engine,
            settings,
            api_key,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(
            &self.addr,
            self.engine.clone(),
            self.settings.clone(),
            self.api_key.clone()
        ).await
    }
}
