use std::path::Path;

use crate::models::chat::{ Content, ContentPart };
use crate::tools::image::jpeg_data_uri;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];

/// A raw inbound turn as the transport delivers it.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundContent {
    Text {
        text: String,
    },
    Photo {
        bytes: Vec<u8>,
        caption: Option<String>,
    },
    Document {
        bytes: Vec<u8>,
        file_name: String,
        caption: Option<String>,
    },
    Unsupported,
}

impl InboundContent {
    pub fn text(&self) -> Option<&str> {
        match self {
            InboundContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

fn is_image_file(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn image_content(bytes: &[u8], caption: &Option<String>) -> Content {
    let mut parts = Vec::with_capacity(2);
    if let Some(caption) = caption.as_deref().filter(|c| !c.trim().is_empty()) {
        parts.push(ContentPart::text(caption));
    }
    parts.push(ContentPart::image(jpeg_data_uri(bytes)));
    Content::Parts(parts)
}

/// Turns an inbound turn into storable content. Mentions of the bot are
/// replaced by its short name. `None` means the content type is not
/// supported.
pub fn build_content(
    inbound: &InboundContent,
    bot_username: Option<&str>,
    short_name: &str
) -> Option<Content> {
    match inbound {
        InboundContent::Text { text } => {
            let text = match bot_username {
                Some(username) if !username.is_empty() => {
                    text.replace(&format!("@{}", username), short_name)
                }
                _ => text.clone(),
            };
            Some(Content::Text(text.trim().to_string()))
        }
        InboundContent::Photo { bytes, caption } => Some(image_content(bytes, caption)),
        InboundContent::Document { bytes, file_name, caption } if is_image_file(file_name) => {
            Some(image_content(bytes, caption))
        }
        InboundContent::Document { .. } | InboundContent::Unsupported => None,
    }
}

/// Whether a multi-party turn is meant for the bot: a reply to one of its
/// messages, or text naming it by username or short name.
pub fn is_addressed(
    text: Option<&str>,
    bot_username: Option<&str>,
    short_name: &str,
    is_reply_to_bot: bool
) -> bool {
    if is_reply_to_bot {
        return true;
    }
    let text = match text {
        Some(t) => t,
        None => {
            return false;
        }
    };
    let by_username = bot_username
        .filter(|u| !u.is_empty())
        .map_or(false, |u| text.contains(&format!("@{}", u)));
    let by_short_name = !short_name.is_empty() && text.contains(short_name);
    by_username || by_short_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mentions_become_short_name() {
        let inbound = InboundContent::Text { text: "  @conductor_bot what's up? ".into() };
        let content = build_content(&inbound, Some("conductor_bot"), "Conductor");
        assert_eq!(content, Some(Content::from("Conductor what's up?")));
    }

    #[test]
    fn test_photo_with_caption() {
        let inbound = InboundContent::Photo { bytes: vec![0xff, 0xd8, 0xff], caption: Some("look".into()) };
        let content = build_content(&inbound, None, "Conductor").unwrap();
        assert_eq!(
            content,
            Content::Parts(
                vec![ContentPart::text("look"), ContentPart::image("data:image/jpeg;base64,/9j/")]
            )
        );
    }

    #[test]
    fn test_documents_need_image_extension() {
        let image = InboundContent::Document {
            bytes: vec![1, 2, 3],
            file_name: "scan.PNG".into(),
            caption: None,
        };
        let pdf = InboundContent::Document {
            bytes: vec![1, 2, 3],
            file_name: "paper.pdf".into(),
            caption: None,
        };
        assert!(matches!(build_content(&image, None, "C"), Some(Content::Parts(p)) if p.len() == 1));
        assert_eq!(build_content(&pdf, None, "C"), None);
        assert_eq!(build_content(&InboundContent::Unsupported, None, "C"), None);
    }

    #[test]
    fn test_addressing_in_group_chats() {
        assert!(is_addressed(Some("hey @conductor_bot"), Some("conductor_bot"), "Conductor", false));
        assert!(is_addressed(Some("Conductor, help"), Some("conductor_bot"), "Conductor", false));
        assert!(is_addressed(None, Some("conductor_bot"), "Conductor", true));
        assert!(!is_addressed(Some("just chatting"), Some("conductor_bot"), "Conductor", false));
        assert!(!is_addressed(None, None, "Conductor", false));
    }
}
