use log::info;
use std::sync::Arc;

use crate::agent::ConversationOrchestrator;
use crate::config::characters::{ Character, CharacterCatalogue };
use crate::config::models::ModelProfile;
use crate::context::replace_images;
use crate::error::{ EngineError, EngineResult };
use crate::history::FeedbackKind;
use crate::llm::ParamMap;
use crate::models::chat::{ ChatId, UserId };
use crate::quota::RateDecision;

pub const TEMPERATURE_CHOICES: [f64; 5] = [0.0, 0.5, 0.8, 1.0, 1.2];
pub const TOP_P_CHOICES: [f64; 5] = [0.8, 0.9, 0.95, 0.98, 1.0];

const TRUNCATED_SUFFIX: &str = "... truncated";

fn is_offered(choices: &[f64], value: f64) -> bool {
    choices.iter().any(|c| (c - value).abs() < 1e-9)
}

/// Cuts `text` to `max_chars` characters, marking the cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str(TRUNCATED_SUFFIX);
    cut
}

/// Per-chat control operations. Anything that changes what a conversation
/// means starts a new conversation id.
pub struct ChatSettings {
    engine: Arc<ConversationOrchestrator>,
    characters: CharacterCatalogue,
}

impl ChatSettings {
    pub fn new(engine: Arc<ConversationOrchestrator>, characters: CharacterCatalogue) -> Self {
        Self { engine, characters }
    }

    pub fn characters(&self) -> &CharacterCatalogue {
        &self.characters
    }

    async fn current_profile(&self, chat_id: ChatId) -> EngineResult<Arc<ModelProfile>> {
        let model_id = self.engine.current_model_id(chat_id).await?;
        self.engine.registry().resolve(&model_id)
    }

    pub async fn reset(&self, chat_id: ChatId) -> EngineResult<String> {
        let id = self.engine.store().create_new_conversation_id(chat_id).await?;
        info!("Chat {} history reset", chat_id);
        Ok(id)
    }

    pub async fn current_model(&self, chat_id: ChatId) -> EngineResult<String> {
        self.engine.current_model_id(chat_id).await
    }

    pub async fn set_model(&self, chat_id: ChatId, model_id: &str) -> EngineResult<()> {
        if !self.engine.registry().contains(model_id) {
            return Err(EngineError::UnsupportedModel(model_id.to_string()));
        }
        let store = self.engine.store();
        store.set_current_model(chat_id, model_id).await?;
        store.create_new_conversation_id(chat_id).await?;
        info!("Chat {} switched to model {}", chat_id, model_id);
        Ok(())
    }

    pub async fn system_prompt(&self, chat_id: ChatId) -> EngineResult<String> {
        let profile = self.current_profile(chat_id).await?;
        Ok(self.engine.store().get_system_prompt(chat_id, &profile.default_system_prompt).await?)
    }

    pub async fn set_system_prompt(&self, chat_id: ChatId, text: &str) -> EngineResult<()> {
        let store = self.engine.store();
        store.set_system_prompt(chat_id, text.trim()).await?;
        store.create_new_conversation_id(chat_id).await?;
        Ok(())
    }

    pub async fn reset_system_prompt(&self, chat_id: ChatId) -> EngineResult<()> {
        let profile = self.current_profile(chat_id).await?;
        self.set_system_prompt(chat_id, &profile.default_system_prompt).await
    }

    pub async fn short_name(&self, chat_id: ChatId) -> EngineResult<String> {
        let default = &self.engine.config().bot_short_name;
        Ok(self.engine.store().get_short_name(chat_id, default).await?)
    }

    pub async fn set_short_name(&self, chat_id: ChatId, name: &str) -> EngineResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::UnsupportedContent("short name cannot be empty".to_string()));
        }
        let store = self.engine.store();
        store.set_short_name(chat_id, name).await?;
        store.create_new_conversation_id(chat_id).await?;
        Ok(())
    }

    pub async fn set_character(&self, chat_id: ChatId, character_id: &str) -> EngineResult<Character> {
        let character = self.characters
            .get(character_id)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedContent(format!("unknown character '{}'", character_id)))?;
        let store = self.engine.store();
        store.set_system_prompt(chat_id, &character.system_prompt).await?;
        store.set_short_name(chat_id, &character.short_name).await?;
        store.create_new_conversation_id(chat_id).await?;
        info!("Chat {} now plays character {}", chat_id, character_id);
        Ok(character)
    }

    pub async fn parameters(&self, chat_id: ChatId) -> EngineResult<ParamMap> {
        let profile = self.current_profile(chat_id).await?;
        Ok(self.engine.store().get_parameters(chat_id, &profile.default_params).await?)
    }

    async fn set_choice(
        &self,
        chat_id: ChatId,
        name: &str,
        choices: &[f64],
        value: f64
    ) -> EngineResult<()> {
        if !is_offered(choices, value) {
            return Err(EngineError::UnsupportedContent(format!("{} = {} is not offered", name, value)));
        }
        let mut partial = ParamMap::new();
        partial.insert(name.to_string(), serde_json::json!(value));
        Ok(self.engine.store().set_parameters(chat_id, &partial).await?)
    }

    pub async fn set_temperature(&self, chat_id: ChatId, value: f64) -> EngineResult<()> {
        self.set_choice(chat_id, "temperature", &TEMPERATURE_CHOICES, value).await
    }

    pub async fn set_top_p(&self, chat_id: ChatId, value: f64) -> EngineResult<()> {
        self.set_choice(chat_id, "top_p", &TOP_P_CHOICES, value).await
    }

    pub async fn remaining(&self, chat_id: ChatId, user_id: UserId) -> EngineResult<RateDecision> {
        let profile = self.current_profile(chat_id).await?;
        let is_subscribed = self.engine.store().is_subscribed(user_id).await?;
        self.engine.limiter().remaining(user_id, &profile, is_subscribed).await
    }

    /// Seconds of subscription left, zero when inactive.
    pub async fn subscription_remaining(&self, user_id: UserId) -> EngineResult<i64> {
        Ok(self.engine.store().subscription_remaining(user_id).await?)
    }

    /// JSON view of what the current model would see. `None` when the
    /// conversation is empty.
    pub async fn history_dump(&self, chat_id: ChatId, is_multi_party: bool) -> EngineResult<Option<String>> {
        let store = self.engine.store();
        let conversation_id = store.get_current_conversation_id(chat_id).await?;
        let history = store.fetch_conversation(&conversation_id).await?;
        if history.is_empty() {
            return Ok(None);
        }
        let profile = self.current_profile(chat_id).await?;
        let mut fitted = self.engine.context().prepare(&replace_images(&history), &profile, is_multi_party)?;
        for m in fitted.iter_mut() {
            m.author_label = None;
        }
        let json = serde_json::to_string(&fitted).map_err(|e| EngineError::Configuration(e.to_string()))?;
        Ok(Some(truncate(&json, self.engine.config().chunk_size)))
    }

    pub async fn save_feedback(
        &self,
        kind: FeedbackKind,
        user_id: UserId,
        message_id: i64
    ) -> EngineResult<()> {
        Ok(self.engine.store().save_feedback(kind, user_id, message_id).await?)
    }
}
