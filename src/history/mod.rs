pub mod memory;
mod redis;
use async_trait::async_trait;
use log::info;
use serde::{ Deserialize, Serialize };
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use crate::cli::Args;
use crate::error::StoreError;
use crate::llm::ParamMap;
use crate::models::chat::{ ChatId, Message, StoredMessage, UserId };

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Like,
    Dislike,
}

impl FromStr for FeedbackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "like" => Ok(FeedbackKind::Like),
            "dislike" => Ok(FeedbackKind::Dislike),
            _ => Err(format!("Unknown feedback kind: {}", s)),
        }
    }
}

impl fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackKind::Like => write!(f, "like"),
            FeedbackKind::Dislike => write!(f, "dislike"),
        }
    }
}

/// Persistence collaborator. Usage events are recorded as a side effect of
/// `append_message` whenever the stored record carries one.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_current_conversation_id(&self, chat_id: ChatId) -> Result<String, StoreError>;

    async fn create_new_conversation_id(&self, chat_id: ChatId) -> Result<String, StoreError>;

    async fn append_message(
        &self,
        conversation_id: &str,
        record: StoredMessage
    ) -> Result<(), StoreError>;

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn count_events(
        &self,
        user_id: UserId,
        stream: &str,
        within_seconds: u64
    ) -> Result<u64, StoreError>;

    async fn subscription_remaining(&self, user_id: UserId) -> Result<i64, StoreError>;

    async fn set_subscription(&self, user_id: UserId, until_timestamp: i64) -> Result<(), StoreError>;

    async fn is_subscribed(&self, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.subscription_remaining(user_id).await? > 0)
    }

    async fn get_system_prompt(&self, chat_id: ChatId, default: &str) -> Result<String, StoreError>;

    async fn set_system_prompt(&self, chat_id: ChatId, text: &str) -> Result<(), StoreError>;

    async fn get_parameters(
        &self,
        chat_id: ChatId,
        defaults: &ParamMap
    ) -> Result<ParamMap, StoreError>;

    async fn set_parameters(&self, chat_id: ChatId, partial: &ParamMap) -> Result<(), StoreError>;

    async fn get_current_model(&self, chat_id: ChatId) -> Result<Option<String>, StoreError>;

    async fn set_current_model(&self, chat_id: ChatId, model_id: &str) -> Result<(), StoreError>;

    async fn get_short_name(&self, chat_id: ChatId, default: &str) -> Result<String, StoreError>;

    async fn set_short_name(&self, chat_id: ChatId, name: &str) -> Result<(), StoreError>;

    async fn save_feedback(
        &self,
        kind: FeedbackKind,
        user_id: UserId,
        message_id: i64
    ) -> Result<(), StoreError>;
}

pub(crate) fn merge_params(defaults: &ParamMap, stored: &ParamMap) -> ParamMap {
    let mut merged = defaults.clone();
    for (k, v) in stored {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

pub fn create_store(args: &Args) -> Result<Arc<dyn Store>, Box<dyn Error + Send + Sync>> {
    match args.store_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "redis" => {
            let store = RedisStore::new(&args.store_host, &args.store_redis_prefix)?;
            Ok(Arc::new(store))
        }
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported store type: {}", args.store_type)
                    )
                )
            ),
    }
}

pub fn initialize_store(args: &Args) -> Result<Arc<dyn Store>, Box<dyn Error + Send + Sync>> {
    info!("Chat state will be stored in: {} at {}", args.store_type, args.store_host);
    create_store(args)
}
