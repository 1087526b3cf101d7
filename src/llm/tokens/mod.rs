pub mod heuristic;
pub mod template;
pub mod tiktoken;

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{ Arc, RwLock };
use log::{ info, warn };
use tiktoken_rs::CoreBPE;

use crate::config::models::ModelProfile;
use crate::llm::BackendFamily;
use crate::models::chat::Message;
use self::heuristic::HeuristicCounter;
use self::template::ChatTemplateCounter;
use self::tiktoken::TiktokenCounter;

pub trait TokenCounter: Send + Sync {
    fn count(&self, messages: &[Message]) -> usize;
}

// Encoders are immutable once built. Two tasks racing on the same key may both
// build one; the first insert wins and the other copy is dropped.
static ENCODERS: Lazy<RwLock<HashMap<String, Arc<CoreBPE>>>> = Lazy::new(||
    RwLock::new(HashMap::new())
);

pub(crate) fn cached_encoder<F>(key: &str, build: F) -> Option<Arc<CoreBPE>>
    where F: FnOnce() -> Option<CoreBPE>
{
    if let Ok(cache) = ENCODERS.read() {
        if let Some(bpe) = cache.get(key) {
            return Some(Arc::clone(bpe));
        }
    }
    let built = Arc::new(build()?);
    match ENCODERS.write() {
        Ok(mut cache) => {
            let entry = cache.entry(key.to_string()).or_insert_with(|| {
                info!("Tokenizer '{}' initialised", key);
                built
            });
            Some(Arc::clone(entry))
        }
        Err(_) => Some(built),
    }
}

pub(crate) fn encoder_by_name(name: &str) -> Option<CoreBPE> {
    let result = match name {
        "p50k_base" => tiktoken_rs::p50k_base(),
        "r50k_base" => tiktoken_rs::r50k_base(),
        "cl100k_base" => tiktoken_rs::cl100k_base(),
        other => {
            warn!("Unknown encoding '{}', using cl100k_base", other);
            tiktoken_rs::cl100k_base()
        }
    };
    match result {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            warn!("Failed to build encoding '{}': {}", name, e);
            None
        }
    }
}

/// Picks the counting strategy for a profile from its backend family.
pub fn counter_for(profile: &ModelProfile) -> Arc<dyn TokenCounter> {
    match profile.family {
        BackendFamily::OpenAI =>
            match TiktokenCounter::for_model(&profile.backend_model_name) {
                Some(counter) => Arc::new(counter),
                None => {
                    warn!(
                        "No tokenizer for '{}', falling back to the heuristic counter",
                        profile.backend_model_name
                    );
                    Arc::new(HeuristicCounter)
                }
            }
        BackendFamily::Anthropic => Arc::new(HeuristicCounter),
        BackendFamily::Local =>
            match ChatTemplateCounter::new(profile.chat_template.clone()) {
                Some(counter) => Arc::new(counter),
                None => Arc::new(HeuristicCounter),
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_cache_returns_the_same_instance() {
        let first = cached_encoder("encoding:test-cache", || encoder_by_name("cl100k_base")).unwrap();
        let second = cached_encoder("encoding:test-cache", || panic!("must not rebuild")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_counter_selection_follows_family() {
        let msgs = vec![Message::user("abcdefgh")];

        let anthropic = ModelProfile::new("claude", "claude-3-5-sonnet", BackendFamily::Anthropic);
        assert_eq!(counter_for(&anthropic).count(&msgs), 4);

        let openai = ModelProfile::new("gpt", "gpt-4o", BackendFamily::OpenAI);
        assert!(counter_for(&openai).count(&msgs) > 0);

        let local = ModelProfile::new("saiga", "IlyaGusev/saiga_llama3_8b", BackendFamily::Local);
        assert!(counter_for(&local).count(&msgs) > counter_for(&openai).count(&msgs));
    }
}
