use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{ merge_params, FeedbackKind, Store };
use crate::error::StoreError;
use crate::llm::ParamMap;
use crate::models::chat::{ ChatId, Message, StoredMessage, UserId };

#[derive(Default)]
struct ChatState {
    conversation_id: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    short_name: Option<String>,
    params: ParamMap,
}

#[derive(Default)]
struct Inner {
    chats: HashMap<ChatId, ChatState>,
    conversations: HashMap<String, Vec<StoredMessage>>,
    events: Vec<(UserId, String, i64)>,
    subscriptions: HashMap<UserId, i64>,
    feedback: Vec<(FeedbackKind, UserId, i64)>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut *guard)
    }

    pub fn stored(&self, conversation_id: &str) -> Vec<StoredMessage> {
        self.with(|inner| inner.conversations.get(conversation_id).cloned().unwrap_or_default())
    }

    pub fn feedback(&self) -> Vec<(FeedbackKind, UserId, i64)> {
        self.with(|inner| inner.feedback.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_current_conversation_id(&self, chat_id: ChatId) -> Result<String, StoreError> {
        Ok(
            self.with(|inner| {
                let chat = inner.chats.entry(chat_id).or_default();
                chat.conversation_id.get_or_insert_with(|| Uuid::new_v4().to_string()).clone()
            })
        )
    }

    async fn create_new_conversation_id(&self, chat_id: ChatId) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.with(|inner| {
            inner.chats.entry(chat_id).or_default().conversation_id = Some(id.clone());
        });
        Ok(id)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        record: StoredMessage
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            if let Some(usage) = &record.usage {
                if usage.retention > 0 {
                    let cutoff = record.timestamp - (usage.retention as i64);
                    inner.events.retain(
                        |(u, s, ts)| *u != usage.user_id || s != &usage.stream || *ts >= cutoff
                    );
                }
                inner.events.push((usage.user_id, usage.stream.clone(), record.timestamp));
            }
            inner.conversations.entry(conversation_id.to_string()).or_default().push(record);
        });
        Ok(())
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(
            self
                .stored(conversation_id)
                .into_iter()
                .map(|r| r.message)
                .collect()
        )
    }

    async fn count_events(
        &self,
        user_id: UserId,
        stream: &str,
        within_seconds: u64
    ) -> Result<u64, StoreError> {
        let now = Utc::now().timestamp();
        let since = now - (within_seconds as i64);
        Ok(
            self.with(|inner| {
                inner.events
                    .iter()
                    .filter(|(u, s, ts)| *u == user_id && s == stream && *ts >= since && *ts <= now)
                    .count() as u64
            })
        )
    }

    async fn subscription_remaining(&self, user_id: UserId) -> Result<i64, StoreError> {
        let now = Utc::now().timestamp();
        Ok(
            self.with(|inner| {
                inner.subscriptions
                    .get(&user_id)
                    .map(|until| (until - now).max(0))
                    .unwrap_or(0)
            })
        )
    }

    async fn set_subscription(&self, user_id: UserId, until_timestamp: i64) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.subscriptions.insert(user_id, until_timestamp);
        });
        Ok(())
    }

    async fn get_system_prompt(&self, chat_id: ChatId, default: &str) -> Result<String, StoreError> {
        Ok(
            self.with(|inner| {
                inner.chats
                    .get(&chat_id)
                    .and_then(|c| c.system_prompt.clone())
                    .unwrap_or_else(|| default.to_string())
            })
        )
    }

    async fn set_system_prompt(&self, chat_id: ChatId, text: &str) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.chats.entry(chat_id).or_default().system_prompt = Some(text.to_string());
        });
        Ok(())
    }

    async fn get_parameters(
        &self,
        chat_id: ChatId,
        defaults: &ParamMap
    ) -> Result<ParamMap, StoreError> {
        Ok(
            self.with(|inner| {
                match inner.chats.get(&chat_id) {
                    Some(chat) => merge_params(defaults, &chat.params),
                    None => defaults.clone(),
                }
            })
        )
    }

    async fn set_parameters(&self, chat_id: ChatId, partial: &ParamMap) -> Result<(), StoreError> {
        self.with(|inner| {
            let chat = inner.chats.entry(chat_id).or_default();
            chat.params = merge_params(&chat.params, partial);
        });
        Ok(())
    }

    async fn get_current_model(&self, chat_id: ChatId) -> Result<Option<String>, StoreError> {
        Ok(self.with(|inner| inner.chats.get(&chat_id).and_then(|c| c.model.clone())))
    }

    async fn set_current_model(&self, chat_id: ChatId, model_id: &str) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.chats.entry(chat_id).or_default().model = Some(model_id.to_string());
        });
        Ok(())
    }

    async fn get_short_name(&self, chat_id: ChatId, default: &str) -> Result<String, StoreError> {
        Ok(
            self.with(|inner| {
                inner.chats
                    .get(&chat_id)
                    .and_then(|c| c.short_name.clone())
                    .unwrap_or_else(|| default.to_string())
            })
        )
    }

    async fn set_short_name(&self, chat_id: ChatId, name: &str) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.chats.entry(chat_id).or_default().short_name = Some(name.to_string());
        });
        Ok(())
    }

    async fn save_feedback(
        &self,
        kind: FeedbackKind,
        user_id: UserId,
        message_id: i64
    ) -> Result<(), StoreError> {
        self.with(|inner| inner.feedback.push((kind, user_id, message_id)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::UsageEvent;

    #[tokio::test]
    async fn test_conversation_id_is_stable_until_reset() {
        let store = MemoryStore::new();
        let first = store.get_current_conversation_id(1).await.unwrap();
        assert_eq!(store.get_current_conversation_id(1).await.unwrap(), first);

        let fresh = store.create_new_conversation_id(1).await.unwrap();
        assert_ne!(fresh, first);
        assert_eq!(store.get_current_conversation_id(1).await.unwrap(), fresh);
    }

    #[tokio::test]
    async fn test_append_records_usage_only_when_present() {
        let store = MemoryStore::new();
        let mut counted = StoredMessage::new(Message::user("hi"));
        counted.usage = Some(UsageEvent { user_id: 7, stream: "gpt-4o".into(), retention: 0 });
        store.append_message("c1", counted).await.unwrap();
        store.append_message("c1", StoredMessage::new(Message::assistant("hello"))).await.unwrap();

        assert_eq!(store.fetch_conversation("c1").await.unwrap().len(), 2);
        assert_eq!(store.count_events(7, "gpt-4o", 60).await.unwrap(), 1);
        assert_eq!(store.count_events(7, "claude", 60).await.unwrap(), 0);
        assert_eq!(store.count_events(8, "gpt-4o", 60).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_events_outside_window_are_not_counted() {
        let store = MemoryStore::new();
        let mut old = StoredMessage::new(Message::user("old"));
        old.timestamp -= 120;
        old.usage = Some(UsageEvent { user_id: 1, stream: "m".into(), retention: 0 });
        store.append_message("c", old).await.unwrap();

        assert_eq!(store.count_events(1, "m", 60).await.unwrap(), 0);
        assert_eq!(store.count_events(1, "m", 600).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_events_past_retention_are_pruned_on_append() {
        let store = MemoryStore::new();
        for (stream, age) in [("m", 500), ("m", 50), ("other", 500)] {
            let mut record = StoredMessage::new(Message::user("old"));
            record.timestamp -= age;
            record.usage = Some(UsageEvent { user_id: 1, stream: stream.into(), retention: 0 });
            store.append_message("c", record).await.unwrap();
        }
        let mut fresh = StoredMessage::new(Message::user("new"));
        fresh.usage = Some(UsageEvent { user_id: 1, stream: "m".into(), retention: 100 });
        store.append_message("c", fresh).await.unwrap();

        assert_eq!(store.count_events(1, "m", 10_000).await.unwrap(), 2);
        assert_eq!(store.count_events(1, "other", 10_000).await.unwrap(), 1);
        assert_eq!(store.with(|inner| inner.events.len()), 3);
    }

    #[tokio::test]
    async fn test_subscription_expiry() {
        let store = MemoryStore::new();
        assert!(!store.is_subscribed(5).await.unwrap());
        store.set_subscription(5, Utc::now().timestamp() + 3600).await.unwrap();
        assert!(store.is_subscribed(5).await.unwrap());
        store.set_subscription(5, Utc::now().timestamp() - 1).await.unwrap();
        assert_eq!(store.subscription_remaining(5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_partial_parameter_updates_accumulate() {
        let store = MemoryStore::new();
        let mut defaults = ParamMap::new();
        defaults.insert("temperature".into(), serde_json::json!(0.6));

        let mut partial = ParamMap::new();
        partial.insert("top_p".into(), serde_json::json!(0.95));
        store.set_parameters(3, &partial).await.unwrap();
        let mut partial = ParamMap::new();
        partial.insert("temperature".into(), serde_json::json!(1.2));
        store.set_parameters(3, &partial).await.unwrap();

        let params = store.get_parameters(3, &defaults).await.unwrap();
        assert_eq!(params["temperature"], serde_json::json!(1.2));
        assert_eq!(params["top_p"], serde_json::json!(0.95));
    }
}
