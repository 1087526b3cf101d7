use log::debug;

use crate::config::models::ModelProfile;
use crate::error::{ EngineError, EngineResult };
use crate::llm::tokens::{ counter_for, TokenCounter };
use crate::models::chat::{ Content, Message, Role };

/// Normalises raw history into what a backend can take and trims it to the
/// configured token budget. Every step returns a new sequence.
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder {
    max_tokens: usize,
}

impl ContextBuilder {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn prepare(
        &self,
        raw_history: &[Message],
        profile: &ModelProfile,
        is_multi_party: bool
    ) -> EngineResult<Vec<Message>> {
        let counter = counter_for(profile);
        self.prepare_with(raw_history, profile.can_handle_images, counter.as_ref(), is_multi_party)
    }

    pub fn prepare_with(
        &self,
        raw_history: &[Message],
        can_handle_images: bool,
        counter: &dyn TokenCounter,
        is_multi_party: bool
    ) -> EngineResult<Vec<Message>> {
        let labelled = if is_multi_party {
            label_authors(raw_history)
        } else {
            raw_history.to_vec()
        };
        let merged = merge_roles(&labelled);
        let filtered = filter_capabilities(merged, can_handle_images);
        let fitted = fit_budget(filtered, counter, self.max_tokens);
        if fitted.is_empty() {
            return Err(
                EngineError::Configuration("conversation context is empty after fitting".to_string())
            );
        }
        Ok(fitted)
    }
}

/// Prefixes plain-text user messages with their author label.
pub fn label_authors(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| {
            match (&m.role, &m.content, &m.author_label) {
                (Role::User, Content::Text(text), Some(label)) if !label.is_empty() => {
                    let mut labelled = m.clone();
                    labelled.content = Content::Text(format!("{}: {}", label, text));
                    labelled
                }
                _ => m.clone(),
            }
        })
        .collect()
}

/// Joins adjacent plain-text messages of the same role and author with a
/// blank line. Non-text content, a role change or an author change breaks
/// the run.
pub fn merge_roles(messages: &[Message]) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for m in messages {
        if let Some(prev) = merged.last_mut() {
            if prev.role == m.role && prev.author_label == m.author_label {
                if let (Content::Text(prev_text), Content::Text(text)) = (&mut prev.content, &m.content) {
                    prev_text.push_str("\n\n");
                    prev_text.push_str(text);
                    continue;
                }
            }
        }
        merged.push(m.clone());
    }
    merged
}

pub fn filter_capabilities(messages: Vec<Message>, can_handle_images: bool) -> Vec<Message> {
    if can_handle_images {
        return messages;
    }
    messages
        .into_iter()
        .filter(|m| m.content.is_text())
        .collect()
}

/// Drops the two oldest turns at a time until the sequence fits. A leading
/// system message is pinned and never dropped; at least two droppable
/// messages always survive.
pub fn fit_budget(
    messages: Vec<Message>,
    counter: &dyn TokenCounter,
    max_tokens: usize
) -> Vec<Message> {
    let pinned = matches!(messages.first(), Some(m) if m.role == Role::System);
    let mut fitted = messages;
    let start = if pinned { 1 } else { 0 };
    let mut tokens = counter.count(&fitted);
    while tokens > max_tokens && fitted.len() - start >= 3 {
        fitted.drain(start..start + 2);
        tokens = counter.count(&fitted);
    }
    debug!("Context fitted: {} message(s), {} token(s)", fitted.len(), tokens);
    fitted
}

/// Text-only view used for prompts and dumps.
pub fn replace_images(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| {
            let mut redacted = m.clone();
            redacted.content = Content::Text(m.content.redacted());
            redacted
        })
        .collect()
}

/// Backends refuse images in assistant turns, so those become user turns.
pub fn fix_image_roles(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut m| {
            if m.role == Role::Assistant && !m.content.is_text() {
                m.role = Role::User;
            }
            m
        })
        .collect()
}

pub fn with_system_prompt(messages: Vec<Message>, system_prompt: &str) -> Vec<Message> {
    let starts_with_system = matches!(messages.first(), Some(m) if m.role == Role::System);
    if starts_with_system || system_prompt.trim().is_empty() {
        return messages;
    }
    let mut with_prompt = Vec::with_capacity(messages.len() + 1);
    with_prompt.push(Message::system(system_prompt));
    with_prompt.extend(messages);
    with_prompt
}
