use super::TokenCounter;
use crate::models::chat::Message;

/// Character-count estimate for backends without a public tokenizer:
/// `len(text) / 2` per text message. Image messages add nothing, which is a
/// known underestimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .filter_map(|m| m.content.as_text())
            .map(|text| text.chars().count() / 2)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{ Content, ContentPart };

    #[test]
    fn test_half_of_text_length() {
        let msgs = vec![Message::user("abcd"), Message::assistant("abc")];
        assert_eq!(HeuristicCounter.count(&msgs), 3);
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let msgs = vec![Message::user("привет мир")];
        assert_eq!(HeuristicCounter.count(&msgs), 5);
    }

    #[test]
    fn test_images_are_free() {
        let msgs = vec![Message::user(Content::Parts(vec![ContentPart::image("data:x")]))];
        assert_eq!(HeuristicCounter.count(&msgs), 0);
    }
}
