pub mod openai;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use log::info;

use super::ParamMap;
use crate::config::models::{ ModelProfile, ModelRegistry };
use crate::error::{ BackendError, EngineError, EngineResult };
use crate::models::chat::Message;
use self::openai::OpenAIChatClient;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        params: &ParamMap
    ) -> Result<String, BackendError>;

    /// Returns a URL of the generated image.
    async fn generate_image(&self, prompt: &str, image_model: &str) -> Result<String, BackendError>;

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, BackendError>;

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> Option<String>;
}

pub fn new_client(
    profile: &ModelProfile
) -> Result<Arc<dyn ChatBackend>, Box<dyn StdError + Send + Sync>> {
    let client = OpenAIChatClient::from_profile(profile)?;
    Ok(Arc::new(client))
}

/// One client per registered model, built once at startup.
#[derive(Clone, Default)]
pub struct BackendPool {
    clients: HashMap<String, Arc<dyn ChatBackend>>,
}

impl BackendPool {
    pub fn from_registry(
        registry: &ModelRegistry
    ) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let mut pool = Self::default();
        for profile in registry.profiles() {
            let client = new_client(profile)?;
            info!(
                "Backend configured: Model={}, Family={}, BackendModel={}, BaseURL={}",
                profile.id,
                profile.family,
                client.get_model(),
                client.get_base_url().as_deref().unwrap_or("adapter default")
            );
            pool.insert(&profile.id, client);
        }
        Ok(pool)
    }

    pub fn insert(&mut self, model_id: &str, client: Arc<dyn ChatBackend>) {
        self.clients.insert(model_id.to_string(), client);
    }

    pub fn get(&self, model_id: &str) -> EngineResult<Arc<dyn ChatBackend>> {
        self.clients
            .get(model_id)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedModel(model_id.to_string()))
    }
}
