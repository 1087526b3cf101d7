use crate::chunk;
use crate::cli::Args;
use crate::config::models::{ load_models, ModelProfile, ModelRegistry };
use crate::config::prompt::load_tools_prompt;
use crate::content::{ build_content, is_addressed, InboundContent };
use crate::context::{ fix_image_roles, with_system_prompt, ContextBuilder };
use crate::error::{ BackendError, EngineError, EngineResult, QuotaKind };
use crate::history::{ initialize_store, Store };
use crate::llm::chat::{ BackendPool, ChatBackend };
use crate::llm::ParamMap;
use crate::models::chat::{ ChatId, Message, StoredMessage, UsageEvent, UserId };
use crate::quota::{ RateLimiter, Tier };
use crate::tools::{ quota_stream, ImageTool, ToolDispatcher, ToolOutcome };

use log::{ debug, error, info, warn };
use std::collections::HashMap;
use std::error::Error;
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio::sync::{ Mutex as AsyncMutex, OwnedMutexGuard };

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub history_max_tokens: usize,
    pub chunk_size: usize,
    pub bot_username: Option<String>,
    pub bot_short_name: String,
    pub backend_timeout: Duration,
}

impl EngineConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            history_max_tokens: args.history_max_tokens,
            chunk_size: args.chunk_size,
            bot_username: args.bot_username.clone(),
            bot_short_name: args.bot_short_name.clone(),
            backend_timeout: Duration::from_secs(args.backend_timeout_secs),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_max_tokens: 6144,
            chunk_size: 3500,
            bot_username: None,
            bot_short_name: "Conductor".to_string(),
            backend_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub user_name: Option<String>,
    pub content: InboundContent,
    pub is_multi_party: bool,
    pub is_reply_to_bot: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Text {
        chunks: Vec<String>,
    },
    Image {
        caption: String,
        image_url: Option<String>,
    },
}

#[derive(Debug)]
pub enum Outcome {
    Answered {
        answer: Answer,
        backend: String,
        record_id: String,
    },
    /// User-caused; conversation state is untouched.
    Rejected(EngineError),
    Failed(String),
    /// Multi-party turn not addressed to the bot, stored without a reply.
    Recorded,
}

/// One async mutex per conversation id, dropped again once nobody holds or
/// waits for it.
type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

fn lock_map(locks: &LockMap) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    match locks.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct ConversationLocks {
    locks: LockMap,
}

/// Held while a turn runs. Dropping it, also when the turn is cancelled,
/// unlocks the conversation and prunes the idle entry.
struct ConversationGuard {
    conversation_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = lock_map(&self.locks);
        if let Some(lock) = map.get(&self.conversation_id) {
            if Arc::strong_count(lock) == 1 {
                map.remove(&self.conversation_id);
            }
        }
    }
}

impl ConversationLocks {
    async fn acquire(&self, conversation_id: &str) -> ConversationGuard {
        let lock = lock_map(&self.locks).entry(conversation_id.to_string()).or_default().clone();
        let mut held = ConversationGuard {
            conversation_id: conversation_id.to_string(),
            guard: None,
            locks: Arc::clone(&self.locks),
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }
}

pub struct ConversationOrchestrator {
    registry: Arc<ModelRegistry>,
    backends: BackendPool,
    store: Arc<dyn Store>,
    limiter: RateLimiter,
    context: ContextBuilder,
    tools: ToolDispatcher,
    locks: ConversationLocks,
    config: EngineConfig,
}

impl ConversationOrchestrator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        backends: BackendPool,
        store: Arc<dyn Store>,
        tools: ToolDispatcher,
        config: EngineConfig
    ) -> Self {
        Self {
            registry,
            backends,
            limiter: RateLimiter::new(store.clone()),
            store,
            context: ContextBuilder::new(config.history_max_tokens),
            tools,
            locks: ConversationLocks::default(),
            config,
        }
    }

    pub async fn from_args(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let registry = load_models(&args.models_path, args.default_model.as_deref())?;
        let backends = BackendPool::from_registry(&registry)?;
        let store = initialize_store(args)?;
        let config = EngineConfig::from_args(args);
        let tools = ToolDispatcher::new(
            load_tools_prompt(args.tools_prompt_path.as_deref())?,
            args.tool_history_turns,
            RateLimiter::new(store.clone()),
            config.backend_timeout
        ).register(Arc::new(ImageTool::new(&args.image_model, args.image_daily_limit)));
        Ok(Self::new(registry, backends, store, tools, config))
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn context(&self) -> &ContextBuilder {
        &self.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The chat's model, falling back to the catalogue default.
    pub async fn current_model_id(&self, chat_id: ChatId) -> EngineResult<String> {
        Ok(
            self.store
                .get_current_model(chat_id).await?
                .unwrap_or_else(|| self.registry.default_model().to_string())
        )
    }

    pub async fn handle_turn(&self, request: TurnRequest) -> Outcome {
        match self.run_turn(&request).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_user_caused() => {
                info!("Turn of user {} in chat {} rejected: {}", request.user_id, request.chat_id, e);
                Outcome::Rejected(e)
            }
            Err(e) => {
                error!("Turn of user {} in chat {} failed: {}", request.user_id, request.chat_id, e);
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn run_turn(&self, request: &TurnRequest) -> EngineResult<Outcome> {
        let chat_id = request.chat_id;
        let short_name = self.store.get_short_name(chat_id, &self.config.bot_short_name).await?;
        let bot_username = self.config.bot_username.as_deref();

        if
            request.is_multi_party &&
            !is_addressed(request.content.text(), bot_username, &short_name, request.is_reply_to_bot)
        {
            return self.record_unaddressed(request, bot_username, &short_name).await;
        }

        let model_id = self.current_model_id(chat_id).await?;
        let profile = self.registry.resolve(&model_id)?;
        let backend = self.backends.get(&model_id)?;

        let is_subscribed = self.store.is_subscribed(request.user_id).await?;
        let decision = self.limiter.remaining(request.user_id, &profile, is_subscribed).await?;
        debug!("User {} has {} {} turn(s) left on {}", request.user_id, decision.remaining, decision.tier, model_id);
        if !decision.allows() {
            let kind = match decision.tier {
                Tier::Standard => QuotaKind::Standard,
                Tier::Premium => QuotaKind::Premium,
            };
            return Err(EngineError::QuotaExceeded(kind));
        }

        let params = self.store.get_parameters(chat_id, &profile.default_params).await?;
        profile.validate_params(&params)?;

        let content = build_content(&request.content, bot_username, &short_name).ok_or_else(||
            EngineError::UnsupportedContent("message type not supported".to_string())
        )?;
        if !content.is_text() && !profile.can_handle_images {
            return Err(
                EngineError::UnsupportedContent(format!("model '{}' cannot handle images", model_id))
            );
        }
        let mut turn = Message::user(content);
        turn.author_label = request.user_name.clone();

        let conversation_id = self.store.get_current_conversation_id(chat_id).await?;
        let _guard = self.locks.acquire(&conversation_id).await;
        self.answer_turn(request, &conversation_id, turn, &profile, backend.as_ref(), &params).await
    }

    async fn record_unaddressed(
        &self,
        request: &TurnRequest,
        bot_username: Option<&str>,
        short_name: &str
    ) -> EngineResult<Outcome> {
        let content = match build_content(&request.content, bot_username, short_name) {
            Some(content) => content,
            None => {
                return Ok(Outcome::Recorded);
            }
        };
        let mut message = Message::user(content);
        message.author_label = request.user_name.clone();
        let mut record = StoredMessage::new(message);
        record.user_id = Some(request.user_id);

        let conversation_id = self.store.get_current_conversation_id(request.chat_id).await?;
        let _guard = self.locks.acquire(&conversation_id).await;
        self.store.append_message(&conversation_id, record).await?;
        debug!("Recorded unaddressed message in chat {}", request.chat_id);
        Ok(Outcome::Recorded)
    }

    async fn answer_turn(
        &self,
        request: &TurnRequest,
        conversation_id: &str,
        turn: Message,
        profile: &ModelProfile,
        backend: &dyn ChatBackend,
        params: &ParamMap
    ) -> EngineResult<Outcome> {
        let mut history = self.store.fetch_conversation(conversation_id).await?;
        let system_prompt = self.store.get_system_prompt(
            request.chat_id,
            &profile.default_system_prompt
        ).await?;
        history.push(turn.clone());
        let fitted = self.context.prepare(&history, profile, request.is_multi_party)?;

        let tool_outcome = if profile.can_handle_tools && !self.tools.is_empty() {
            self.tools.dispatch(backend, &fitted, request.user_id).await?
        } else {
            ToolOutcome::NoTool
        };
        let executed = match tool_outcome {
            ToolOutcome::QuotaExceeded { tool_name } => {
                return Err(EngineError::QuotaExceeded(QuotaKind::Tool(tool_name)));
            }
            ToolOutcome::Executed { invocation, output } => Some((invocation, output)),
            ToolOutcome::NoTool => None,
        };

        let mut user_record = StoredMessage::new(turn);
        user_record.user_id = Some(request.user_id);
        user_record.model_id = Some(profile.id.clone());
        user_record.usage = Some(UsageEvent {
            user_id: request.user_id,
            stream: profile.id.clone(),
            retention: profile.limits.longest_interval(),
        });
        self.store.append_message(conversation_id, user_record).await?;

        if let Some((invocation, output)) = executed {
            let mut record = StoredMessage::new(Message::assistant(output.content));
            record.user_id = Some(request.user_id);
            record.model_id = Some(invocation.tool_name.clone());
            record.system_prompt = Some(system_prompt);
            record.usage = Some(UsageEvent {
                user_id: request.user_id,
                stream: quota_stream(&invocation.tool_name),
                retention: self.tools.quota_window(&invocation.tool_name),
            });
            let record_id = record.record_id.clone();
            self.store.append_message(conversation_id, record).await?;
            return Ok(Outcome::Answered {
                answer: Answer::Image { caption: output.caption, image_url: output.image_url },
                backend: invocation.tool_name,
                record_id,
            });
        }

        let messages = with_system_prompt(fix_image_roles(fitted), &system_prompt);
        let answer = self.complete(profile, backend, &messages, params).await?;

        let mut record = StoredMessage::new(Message::assistant(answer.as_str()));
        record.user_id = Some(request.user_id);
        record.model_id = Some(profile.id.clone());
        record.system_prompt = Some(system_prompt);
        let record_id = record.record_id.clone();
        self.store.append_message(conversation_id, record).await?;

        Ok(Outcome::Answered {
            answer: Answer::Text { chunks: chunk::split(&answer, self.config.chunk_size) },
            backend: profile.id.clone(),
            record_id,
        })
    }

    async fn complete(
        &self,
        profile: &ModelProfile,
        backend: &dyn ChatBackend,
        messages: &[Message],
        params: &ParamMap
    ) -> Result<String, BackendError> {
        let last = messages
            .last()
            .map(|m| m.content.preview())
            .unwrap_or_default();
        info!("Calling {} with {} message(s), last: '{}'", profile.id, messages.len(), last);

        let timeout = self.config.backend_timeout;
        let answer = match tokio::time::timeout(timeout, backend.complete(messages, params)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Backend {} did not answer within {}s", profile.id, timeout.as_secs());
                return Err(BackendError::Timeout(timeout.as_secs()));
            }
        };
        if answer.trim().is_empty() {
            return Err(BackendError::EmptyResponse);
        }
        let preview: String = answer.replace('\n', " ").chars().take(40).collect();
        info!("Answer from {}: '{}'", profile.id, preview);
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{ TierLimit, TierLimits };
    use crate::config::prompt::ToolsPrompt;
    use crate::history::MemoryStore;
    use crate::llm::chat::mock::MockBackend;
    use crate::llm::BackendFamily;
    use crate::models::chat::{ Content, Role };
    use crate::config::models::ParamRange;

    const IMAGE_ANSWER: &str = r#"{"tools": {"image": {"prompt": "a red fox", "caption": "Fox"}}}"#;

    struct Harness {
        engine: Arc<ConversationOrchestrator>,
        store: Arc<MemoryStore>,
        backend: Arc<MockBackend>,
    }

    fn profile(id: &str) -> ModelProfile {
        let mut profile = ModelProfile::new(id, id, BackendFamily::Anthropic);
        profile.default_system_prompt = "You are helpful.".to_string();
        profile.limits = TierLimits {
            standard: TierLimit { limit: 10, interval: 86400 },
            subscribed: TierLimit { limit: 100, interval: 86400 },
        };
        profile
    }

    fn harness_with(profiles: Vec<ModelProfile>, backend: MockBackend, config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(backend);
        let registry = Arc::new(ModelRegistry::new(profiles, None).unwrap());
        let mut backends = BackendPool::default();
        for id in registry.ids() {
            backends.insert(&id, backend.clone());
        }
        let tools = ToolDispatcher::new(
            ToolsPrompt::default(),
            4,
            RateLimiter::new(store.clone()),
            config.backend_timeout
        ).register(Arc::new(ImageTool::new("dall-e-3", 1)));
        let engine = ConversationOrchestrator::new(registry, backends, store.clone(), tools, config);
        Harness { engine: Arc::new(engine), store, backend }
    }

    fn harness(backend: MockBackend) -> Harness {
        harness_with(vec![profile("claude")], backend, EngineConfig::default())
    }

    fn text_turn(text: &str) -> TurnRequest {
        TurnRequest {
            chat_id: 1,
            user_id: 42,
            user_name: Some("Ann".to_string()),
            content: InboundContent::Text { text: text.to_string() },
            is_multi_party: false,
            is_reply_to_bot: false,
        }
    }

    async fn stored(h: &Harness) -> Vec<StoredMessage> {
        let conversation_id = h.store.get_current_conversation_id(1).await.unwrap();
        h.store.stored(&conversation_id)
    }

    #[tokio::test]
    async fn test_answer_is_persisted_with_system_prompt() {
        let h = harness(MockBackend::with_answers(&["Hello there"]));
        let outcome = h.engine.handle_turn(text_turn("hi")).await;

        match outcome {
            Outcome::Answered { answer, backend, .. } => {
                assert_eq!(answer, Answer::Text { chunks: vec!["Hello there".to_string()] });
                assert_eq!(backend, "claude");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let (sent, _) = &h.backend.calls()[0];
        assert_eq!(sent[0], Message::system("You are helpful."));
        assert_eq!(sent[1].content, Content::from("hi"));

        let records = stored(&h).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].usage.as_ref().map(|u| u.stream.as_str()), Some("claude"));
        assert_eq!(records[1].message.role, Role::Assistant);
        assert_eq!(records[1].model_id.as_deref(), Some("claude"));
        assert_eq!(records[1].system_prompt.as_deref(), Some("You are helpful."));
        assert!(records[1].usage.is_none());
    }

    #[tokio::test]
    async fn test_long_answers_are_chunked_in_order() {
        let config = EngineConfig { chunk_size: 4, ..EngineConfig::default() };
        let h = harness_with(vec![profile("claude")], MockBackend::with_answers(&["abcdefghij"]), config);
        match h.engine.handle_turn(text_turn("hi")).await {
            Outcome::Answered { answer: Answer::Text { chunks }, .. } => {
                assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_quota_exhaustion_rejects_without_backend_call() {
        let answers: Vec<&str> = vec!["ok"; 10];
        let h = harness(MockBackend::with_answers(&answers));
        for i in 0..10 {
            let outcome = h.engine.handle_turn(text_turn(&format!("turn {}", i))).await;
            assert!(matches!(outcome, Outcome::Answered { .. }), "turn {}", i);
        }
        let profile = h.engine.registry().resolve("claude").unwrap();
        let decision = h.engine.limiter().remaining(42, &profile, false).await.unwrap();
        assert_eq!(decision.remaining, 0);

        let outcome = h.engine.handle_turn(text_turn("one more")).await;
        assert!(matches!(outcome, Outcome::Rejected(EngineError::QuotaExceeded(QuotaKind::Standard))));
        assert_eq!(h.backend.call_count(), 10);
        assert_eq!(stored(&h).await.len(), 20);
    }

    #[tokio::test]
    async fn test_backend_failure_persists_no_answer() {
        let backend = MockBackend::new();
        backend.push_failure("503 from provider");
        let h = harness(backend);

        let outcome = h.engine.handle_turn(text_turn("hi")).await;
        assert!(matches!(outcome, Outcome::Failed(_)));
        let records = stored(&h).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message.role, Role::User);
    }

    #[tokio::test]
    async fn test_backend_timeout_is_failure() {
        let config = EngineConfig { backend_timeout: Duration::from_millis(20), ..EngineConfig::default() };
        let backend = MockBackend::with_answers(&["late"]).with_delay(Duration::from_millis(200));
        let h = harness_with(vec![profile("claude")], backend, config);
        assert!(matches!(h.engine.handle_turn(text_turn("hi")).await, Outcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_unregistered_model_is_rejected() {
        let h = harness(MockBackend::new());
        h.store.set_current_model(1, "retired-model").await.unwrap();
        let outcome = h.engine.handle_turn(text_turn("hi")).await;
        assert!(matches!(outcome, Outcome::Rejected(EngineError::UnsupportedModel(_))));
        assert_eq!(h.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_parameter_is_rejected() {
        let mut strict = profile("claude");
        strict.param_ranges.insert("temperature".into(), ParamRange { min: None, max: Some(1.0) });
        let h = harness_with(vec![strict], MockBackend::new(), EngineConfig::default());
        let mut partial = ParamMap::new();
        partial.insert("temperature".into(), serde_json::json!(1.2));
        h.store.set_parameters(1, &partial).await.unwrap();

        let outcome = h.engine.handle_turn(text_turn("hi")).await;
        assert!(matches!(outcome, Outcome::Rejected(EngineError::UnsupportedContent(_))));
        assert_eq!(h.backend.call_count(), 0);
        assert!(stored(&h).await.is_empty());
    }

    #[tokio::test]
    async fn test_images_need_capable_model() {
        let h = harness(MockBackend::new());
        let mut request = text_turn("");
        request.content = InboundContent::Photo { bytes: vec![1, 2, 3], caption: None };
        let outcome = h.engine.handle_turn(request).await;
        assert!(matches!(outcome, Outcome::Rejected(EngineError::UnsupportedContent(_))));

        let mut request = text_turn("");
        request.content = InboundContent::Unsupported;
        let outcome = h.engine.handle_turn(request).await;
        assert!(matches!(outcome, Outcome::Rejected(EngineError::UnsupportedContent(_))));
    }

    #[tokio::test]
    async fn test_unaddressed_group_message_is_only_recorded() {
        let config = EngineConfig { bot_username: Some("conductor_bot".into()), ..EngineConfig::default() };
        let h = harness_with(vec![profile("claude")], MockBackend::with_answers(&["Hi Bob"]), config);

        let mut chatter = text_turn("lunch anyone?");
        chatter.is_multi_party = true;
        chatter.user_name = Some("Ann".into());
        assert!(matches!(h.engine.handle_turn(chatter).await, Outcome::Recorded));
        assert_eq!(h.backend.call_count(), 0);

        let mut addressed = text_turn("@conductor_bot say hi");
        addressed.is_multi_party = true;
        addressed.user_name = Some("Bob".into());
        assert!(matches!(h.engine.handle_turn(addressed).await, Outcome::Answered { .. }));

        let (sent, _) = &h.backend.calls()[0];
        let texts: Vec<String> = sent
            .iter()
            .map(|m| m.content.redacted())
            .collect();
        assert_eq!(texts, vec!["You are helpful.", "Ann: lunch anyone?", "Bob: Conductor say hi"]);

        let records = stored(&h).await;
        assert!(records[0].usage.is_none());
        assert!(records[1].usage.is_some());
    }

    #[tokio::test]
    async fn test_tool_answer_short_circuits_completion() {
        let mut painter = profile("gpt");
        painter.can_handle_tools = true;
        painter.can_handle_images = true;
        let h = harness_with(vec![painter], MockBackend::with_answers(&[IMAGE_ANSWER]), EngineConfig::default());

        match h.engine.handle_turn(text_turn("draw a fox")).await {
            Outcome::Answered { answer, backend, .. } => {
                assert_eq!(backend, "image");
                assert_eq!(answer, Answer::Image {
                    caption: "Fox".to_string(),
                    image_url: Some("https://images.example/generated.png".to_string()),
                });
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.backend.call_count(), 1);

        let records = stored(&h).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].model_id.as_deref(), Some("image"));
        assert!(!records[1].message.content.is_text());
    }

    #[tokio::test]
    async fn test_tool_quota_is_rejected_and_leaves_history_alone() {
        let mut painter = profile("gpt");
        painter.can_handle_tools = true;
        painter.can_handle_images = true;
        let backend = MockBackend::with_answers(&[IMAGE_ANSWER, IMAGE_ANSWER]);
        let h = harness_with(vec![painter], backend, EngineConfig::default());

        assert!(matches!(h.engine.handle_turn(text_turn("draw a fox")).await, Outcome::Answered { .. }));
        let outcome = h.engine.handle_turn(text_turn("another one")).await;
        assert!(
            matches!(outcome, Outcome::Rejected(EngineError::QuotaExceeded(QuotaKind::Tool(ref t))) if t == "image")
        );
        assert_eq!(stored(&h).await.len(), 2);
    }

    #[tokio::test]
    async fn test_image_history_is_re_roled_before_completion() {
        let mut painter = profile("gpt");
        painter.can_handle_tools = true;
        painter.can_handle_images = true;
        let backend = MockBackend::with_answers(&[IMAGE_ANSWER, r#"{"tools": {}}"#, "Nice fox"]);
        let h = harness_with(vec![painter], backend, EngineConfig::default());

        h.engine.handle_turn(text_turn("draw a fox")).await;
        let outcome = h.engine.handle_turn(text_turn("what is it?")).await;
        assert!(matches!(outcome, Outcome::Answered { .. }));

        let calls = h.backend.calls();
        let (sent, _) = &calls[2];
        assert!(sent.iter().all(|m| m.role != Role::Assistant || m.content.is_text()));
    }

    #[tokio::test]
    async fn test_turns_in_one_conversation_are_serialised() {
        let backend = MockBackend::with_answers(&["first", "second"]).with_delay(Duration::from_millis(30));
        let h = harness(backend);

        let a = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.handle_turn(text_turn("one")).await })
        };
        let b = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.handle_turn(text_turn("two")).await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(matches!(a, Outcome::Answered { .. }));
        assert!(matches!(b, Outcome::Answered { .. }));

        let roles: Vec<Role> = stored(&h).await
            .iter()
            .map(|r| r.message.role)
            .collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);

        let calls = h.backend.calls();
        assert_eq!(calls[1].0.len(), 4);
        assert_eq!(h.engine.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_lock_entry_is_pruned_when_turn_is_cancelled() {
        let locks = Arc::new(ConversationLocks::default());

        let held = locks.acquire("c1").await;
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.len(), 0);

        let running = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("c2").await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.len(), 1);
        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_usage_events_carry_the_longest_tier_window() {
        let h = harness(MockBackend::with_answers(&["hello"]));
        h.engine.handle_turn(text_turn("hi")).await;

        let records = stored(&h).await;
        let usage = records[0].usage.clone().unwrap();
        let profile = h.engine.registry().resolve(&usage.stream).unwrap();
        assert_eq!(usage.retention, profile.limits.longest_interval());
    }
}
