use std::sync::Arc;
use tiktoken_rs::CoreBPE;

use super::{ cached_encoder, encoder_by_name, TokenCounter };
use crate::models::chat::Message;

/// Flat cost charged for any multimodal message; exact image accounting is
/// not attempted.
pub const IMAGE_MESSAGE_COST: usize = 1000;

pub struct TiktokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    pub fn for_model(model_name: &str) -> Option<Self> {
        let key = format!("model:{}", model_name);
        let bpe = cached_encoder(&key, || {
            tiktoken_rs::get_bpe_from_model(model_name).ok().or_else(|| encoder_by_name("cl100k_base"))
        })?;
        Some(Self { bpe })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| {
                match m.content.as_text() {
                    Some(text) => self.bpe.encode_ordinary(text).len(),
                    None => IMAGE_MESSAGE_COST,
                }
            })
            .sum()
    }
}
