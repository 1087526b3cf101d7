use async_trait::async_trait;
use crate::error::StoreError;
use crate::history::{ merge_params, FeedbackKind, Store };
use crate::llm::ParamMap;
use crate::models::chat::{ ChatId, Message, StoredMessage, UserId };
use chrono::Utc;
use log::error;
use redis::{ Client, AsyncCommands };
use serde::{ Serialize, Deserialize };
use uuid::Uuid;

#[derive(Serialize, Deserialize)]
struct StoredFeedback {
    kind: FeedbackKind,
    user_id: UserId,
    message_id: i64,
    timestamp: i64,
}

/// Layout:
/// `{prefix}chat:{chat_id}` hash of per-chat settings,
/// `{prefix}conv:{conversation_id}` list of JSON records,
/// `{prefix}events:{user_id}:{stream}` sorted set scored by unix time,
/// `{prefix}sub:{user_id}` subscription end timestamp,
/// `{prefix}feedback` list of JSON records.
pub struct RedisStore {
    client: Client,
    key_prefix: String,
}

impl RedisStore {
    pub fn new(host: &str, key_prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(host)?,
            key_prefix: key_prefix.to_string(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn chat_key(&self, chat_id: ChatId) -> String {
        format!("{}chat:{}", self.key_prefix, chat_id)
    }

    fn conversation_key(&self, conversation_id: &str) -> String {
        format!("{}conv:{}", self.key_prefix, conversation_id)
    }

    fn events_key(&self, user_id: UserId, stream: &str) -> String {
        format!("{}events:{}:{}", self.key_prefix, user_id, stream)
    }

    fn subscription_key(&self, user_id: UserId) -> String {
        format!("{}sub:{}", self.key_prefix, user_id)
    }

    async fn get_chat_field(&self, chat_id: ChatId, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = conn.hget(self.chat_key(chat_id), field).await?;
        Ok(value)
    }

    async fn set_chat_field(&self, chat_id: ChatId, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.hset(self.chat_key(chat_id), field, value).await?;
        Ok(())
    }

    async fn stored_params(&self, chat_id: ChatId) -> Result<ParamMap, StoreError> {
        match self.get_chat_field(chat_id, "params").await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(ParamMap::new()),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_current_conversation_id(&self, chat_id: ChatId) -> Result<String, StoreError> {
        if let Some(id) = self.get_chat_field(chat_id, "conversation_id").await? {
            return Ok(id);
        }
        // Concurrent first turns race here; HSETNX lets exactly one id win.
        let candidate = Uuid::new_v4().to_string();
        let mut conn = self.get_connection().await?;
        let key = self.chat_key(chat_id);
        let created: bool = conn.hset_nx(&key, "conversation_id", &candidate).await?;
        if created {
            return Ok(candidate);
        }
        let winner: Option<String> = conn.hget(&key, "conversation_id").await?;
        match winner {
            Some(winner) => Ok(winner),
            None => self.create_new_conversation_id(chat_id).await,
        }
    }

    async fn create_new_conversation_id(&self, chat_id: ChatId) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.set_chat_field(chat_id, "conversation_id", &id).await?;
        Ok(id)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        record: StoredMessage
    ) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let json_msg = serde_json::to_string(&record)?;
        let _: i64 = conn.rpush(self.conversation_key(conversation_id), &json_msg).await?;
        if let Some(usage) = &record.usage {
            let key = self.events_key(usage.user_id, &usage.stream);
            let _: i64 = conn.zadd(&key, &record.record_id, record.timestamp).await?;
            if usage.retention > 0 {
                let cutoff = record.timestamp - (usage.retention as i64);
                let _: i64 = conn.zrembyscore(&key, "-inf", format!("({}", cutoff)).await?;
            }
        }
        Ok(())
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.get_connection().await?;
        let json_entries: Vec<String> = conn.lrange(
            self.conversation_key(conversation_id),
            0,
            -1
        ).await?;
        let mut messages = Vec::with_capacity(json_entries.len());

        for json_entry in &json_entries {
            match serde_json::from_str::<StoredMessage>(json_entry) {
                Ok(record) => messages.push(record.message),
                Err(e) => {
                    error!("Error parsing history entry: {}", e);
                }
            }
        }

        Ok(messages)
    }

    async fn count_events(
        &self,
        user_id: UserId,
        stream: &str,
        within_seconds: u64
    ) -> Result<u64, StoreError> {
        let mut conn = self.get_connection().await?;
        let now = Utc::now().timestamp();
        let since = now - (within_seconds as i64);
        let count: u64 = conn.zcount(self.events_key(user_id, stream), since, now).await?;
        Ok(count)
    }

    async fn subscription_remaining(&self, user_id: UserId) -> Result<i64, StoreError> {
        let mut conn = self.get_connection().await?;
        let until: Option<i64> = conn.get(self.subscription_key(user_id)).await?;
        let now = Utc::now().timestamp();
        Ok(until.map(|u| (u - now).max(0)).unwrap_or(0))
    }

    async fn set_subscription(&self, user_id: UserId, until_timestamp: i64) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.set(self.subscription_key(user_id), until_timestamp).await?;
        Ok(())
    }

    async fn get_system_prompt(&self, chat_id: ChatId, default: &str) -> Result<String, StoreError> {
        Ok(
            self
                .get_chat_field(chat_id, "system_prompt").await?
                .unwrap_or_else(|| default.to_string())
        )
    }

    async fn set_system_prompt(&self, chat_id: ChatId, text: &str) -> Result<(), StoreError> {
        self.set_chat_field(chat_id, "system_prompt", text).await
    }

    async fn get_parameters(
        &self,
        chat_id: ChatId,
        defaults: &ParamMap
    ) -> Result<ParamMap, StoreError> {
        let stored = self.stored_params(chat_id).await?;
        Ok(merge_params(defaults, &stored))
    }

    async fn set_parameters(&self, chat_id: ChatId, partial: &ParamMap) -> Result<(), StoreError> {
        let stored = self.stored_params(chat_id).await?;
        let merged = merge_params(&stored, partial);
        self.set_chat_field(chat_id, "params", &serde_json::to_string(&merged)?).await
    }

    async fn get_current_model(&self, chat_id: ChatId) -> Result<Option<String>, StoreError> {
        self.get_chat_field(chat_id, "model").await
    }

    async fn set_current_model(&self, chat_id: ChatId, model_id: &str) -> Result<(), StoreError> {
        self.set_chat_field(chat_id, "model", model_id).await
    }

    async fn get_short_name(&self, chat_id: ChatId, default: &str) -> Result<String, StoreError> {
        Ok(
            self
                .get_chat_field(chat_id, "short_name").await?
                .unwrap_or_else(|| default.to_string())
        )
    }

    async fn set_short_name(&self, chat_id: ChatId, name: &str) -> Result<(), StoreError> {
        self.set_chat_field(chat_id, "short_name", name).await
    }

    async fn save_feedback(
        &self,
        kind: FeedbackKind,
        user_id: UserId,
        message_id: i64
    ) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let record = StoredFeedback {
            kind,
            user_id,
            message_id,
            timestamp: Utc::now().timestamp(),
        };
        let key = format!("{}feedback", self.key_prefix);
        let _: i64 = conn.rpush(key, serde_json::to_string(&record)?).await?;
        Ok(())
    }
}
