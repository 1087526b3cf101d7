use std::sync::Arc;
use tiktoken_rs::CoreBPE;

use super::{ cached_encoder, encoder_by_name, TokenCounter };
use crate::config::models::ChatTemplate;
use crate::models::chat::{ Content, ContentPart, Message, IMAGE_PLACEHOLDER };

/// Counts what a locally served model actually sees: every turn rendered
/// through its chat template plus the trailing generation prompt.
///
/// The rendered text is encoded with the configured tiktoken encoding, not
/// the model's own tokenizer, so the result is an approximation.
pub struct ChatTemplateCounter {
    template: ChatTemplate,
    bpe: Arc<CoreBPE>,
}

impl ChatTemplateCounter {
    pub fn new(template: ChatTemplate) -> Option<Self> {
        let key = format!("encoding:{}", template.encoding);
        let bpe = cached_encoder(&key, || encoder_by_name(&template.encoding))?;
        Some(Self { template, bpe })
    }

    pub fn render(&self, messages: &[Message]) -> String {
        let mut rendered = String::new();
        for m in messages {
            let content = match &m.content {
                Content::Text(text) => text.clone(),
                Content::Parts(parts) =>
                    parts
                        .iter()
                        .map(|p| {
                            match p {
                                ContentPart::Text { text } => text.as_str(),
                                ContentPart::ImageUrl { .. } => IMAGE_PLACEHOLDER,
                            }
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
            };
            rendered.push_str(
                &self.template.turn.replace("{role}", m.role.as_str()).replace("{content}", &content)
            );
        }
        rendered.push_str(&self.template.generation_prompt);
        rendered
    }
}

impl TokenCounter for ChatTemplateCounter {
    fn count(&self, messages: &[Message]) -> usize {
        self.bpe.encode_with_special_tokens(&self.render(messages)).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_uses_turn_template_and_generation_prompt() {
        let counter = ChatTemplateCounter::new(ChatTemplate::default()).unwrap();
        let rendered = counter.render(&[Message::system("be brief"), Message::user("hi")]);
        assert_eq!(
            rendered,
            "<|im_start|>system\nbe brief<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_generation_prompt_is_counted() {
        let counter = ChatTemplateCounter::new(ChatTemplate::default()).unwrap();
        let empty = counter.count(&[]);
        assert!(empty > 0);
        assert!(counter.count(&[Message::user("hi")]) > empty);
    }

    #[test]
    fn test_images_render_as_placeholder() {
        let counter = ChatTemplateCounter::new(ChatTemplate::default()).unwrap();
        let msg = Message::user(Content::Parts(vec![ContentPart::text("see"), ContentPart::image("data:x")]));
        assert!(counter.render(&[msg]).contains("see\n<image>"));
    }
}
