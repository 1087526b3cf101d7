pub mod image;

use async_trait::async_trait;
use log::{ debug, info, warn };
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::models::TierLimit;
use crate::config::prompt::ToolsPrompt;
use crate::context::replace_images;
use crate::error::{ BackendError, EngineResult };
use crate::llm::chat::ChatBackend;
use crate::llm::ParamMap;
use crate::models::chat::{ Content, Message, UserId };
use crate::quota::RateLimiter;

pub use self::image::ImageTool;

pub type ToolArguments = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: ToolArguments,
}

/// What a tool hands back: the content to store and the pieces the
/// transport delivers separately.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub caption: String,
    pub image_url: Option<String>,
    pub content: Content,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Section appended to the selection prompt, including the expected
    /// JSON shape.
    fn description(&self) -> String;

    fn required_arguments(&self) -> &[&'static str];

    fn quota(&self) -> TierLimit;

    async fn execute(
        &self,
        backend: &dyn ChatBackend,
        arguments: &ToolArguments
    ) -> Result<ToolOutput, BackendError>;
}

pub fn quota_stream(tool_name: &str) -> String {
    format!("tool:{}", tool_name)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    NoTool,
    Executed {
        invocation: ToolInvocation,
        output: ToolOutput,
    },
    QuotaExceeded {
        tool_name: String,
    },
}

#[derive(Debug)]
enum MalformedToolResponse {
    NoJsonObject,
    InvalidJson(serde_json::Error),
    MissingToolsKey,
}

impl fmt::Display for MalformedToolResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedToolResponse::NoJsonObject => write!(f, "no JSON object in answer"),
            MalformedToolResponse::InvalidJson(e) => write!(f, "invalid JSON: {}", e),
            MalformedToolResponse::MissingToolsKey => write!(f, "no 'tools' object"),
        }
    }
}

fn extract_tools(answer: &str) -> Result<serde_json::Map<String, Value>, MalformedToolResponse> {
    let begin = answer.find('{').ok_or(MalformedToolResponse::NoJsonObject)?;
    let end = answer.rfind('}').ok_or(MalformedToolResponse::NoJsonObject)?;
    if end < begin {
        return Err(MalformedToolResponse::NoJsonObject);
    }
    let parsed: Value = serde_json
        ::from_str(&answer[begin..=end])
        .map_err(MalformedToolResponse::InvalidJson)?;
    match parsed.get("tools") {
        Some(Value::Object(tools)) => Ok(tools.clone()),
        _ => Err(MalformedToolResponse::MissingToolsKey),
    }
}

/// Reads the selection answer of the phase-1 call. The model may wrap the
/// JSON in prose, so the outermost `{...}` span is decoded. Anything
/// malformed yields no invocations. Only string arguments are kept.
pub fn parse_tool_selection(answer: &str) -> Vec<ToolInvocation> {
    let tools = match extract_tools(answer) {
        Ok(tools) => tools,
        Err(e) => {
            debug!("Tool selection answer ignored: {}", e);
            return Vec::new();
        }
    };
    tools
        .into_iter()
        .filter_map(|(tool_name, args)| {
            let args = match args {
                Value::Object(args) => args,
                _ => {
                    return None;
                }
            };
            let arguments = args
                .into_iter()
                .filter_map(|(k, v)| {
                    match v {
                        Value::String(s) => Some((k, s)),
                        _ => None,
                    }
                })
                .collect();
            Some(ToolInvocation { tool_name, arguments })
        })
        .collect()
}

/// Text-only digest of the last `turns` messages: `role: content` blocks
/// separated by blank lines.
pub fn summarize(history: &[Message], turns: usize) -> String {
    let start = history.len().saturating_sub(turns);
    replace_images(&history[start..])
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content.redacted()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct ToolDispatcher {
    tools: Vec<Arc<dyn Tool>>,
    prompt: ToolsPrompt,
    history_turns: usize,
    limiter: RateLimiter,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(
        prompt: ToolsPrompt,
        history_turns: usize,
        limiter: RateLimiter,
        timeout: Duration
    ) -> Self {
        Self {
            tools: Vec::new(),
            prompt,
            history_turns,
            limiter,
            timeout,
        }
    }

    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        info!("Tool registered: {}", tool.name());
        self.tools.push(tool);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Quota window of a registered tool, zero when unknown.
    pub fn quota_window(&self, tool_name: &str) -> u64 {
        self.tools
            .iter()
            .find(|t| t.name() == tool_name)
            .map_or(0, |t| t.quota().interval)
    }

    pub fn selection_prompt(&self, history: &[Message]) -> Message {
        let descriptions = self.tools
            .iter()
            .map(|t| format!("### {}\n{}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let conversation = summarize(history, self.history_turns);
        Message::user(self.prompt.render(&descriptions, &conversation))
    }

    /// First registered tool the answer names with all of its required
    /// arguments.
    fn choose(&self, invocations: Vec<ToolInvocation>) -> Option<(Arc<dyn Tool>, ToolInvocation)> {
        for tool in &self.tools {
            let found = invocations.iter().find(|i| i.tool_name == tool.name());
            if let Some(invocation) = found {
                let complete = tool
                    .required_arguments()
                    .iter()
                    .all(|arg| invocation.arguments.get(*arg).map_or(false, |v| !v.trim().is_empty()));
                if complete {
                    return Some((tool.clone(), invocation.clone()));
                }
                debug!("Tool '{}' selected without its required arguments", tool.name());
            }
        }
        None
    }

    /// Phase 1. Every failure here, including the backend call itself,
    /// means no tool.
    pub async fn select(
        &self,
        backend: &dyn ChatBackend,
        history: &[Message]
    ) -> Option<(Arc<dyn Tool>, ToolInvocation)> {
        if self.tools.is_empty() {
            return None;
        }
        let prompt = [self.selection_prompt(history)];
        let answer = match tokio::time::timeout(self.timeout, backend.complete(&prompt, &ParamMap::new())).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!("Tool selection call failed, continuing without tools: {}", e);
                return None;
            }
            Err(_) => {
                warn!("Tool selection call timed out, continuing without tools");
                return None;
            }
        };
        self.choose(parse_tool_selection(&answer))
    }

    /// Phases 1 and 2. Only a failure while executing a chosen tool is an
    /// error.
    pub async fn dispatch(
        &self,
        backend: &dyn ChatBackend,
        history: &[Message],
        user_id: UserId
    ) -> EngineResult<ToolOutcome> {
        let (tool, invocation) = match self.select(backend, history).await {
            Some(selected) => selected,
            None => {
                return Ok(ToolOutcome::NoTool);
            }
        };
        let stream = quota_stream(tool.name());
        let remaining = self.limiter.tool_remaining(user_id, &stream, tool.quota()).await?;
        if remaining == 0 {
            info!("Tool '{}' quota exhausted for user {}", tool.name(), user_id);
            return Ok(ToolOutcome::QuotaExceeded { tool_name: tool.name().to_string() });
        }
        info!("Executing tool '{}' for user {} ({} left)", tool.name(), user_id, remaining);
        let output = match tokio::time::timeout(self.timeout, tool.execute(backend, &invocation.arguments)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackendError::Timeout(self.timeout.as_secs()).into());
            }
        };
        Ok(ToolOutcome::Executed { invocation, output })
    }
}
