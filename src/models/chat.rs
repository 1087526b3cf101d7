use serde::{ Serialize, Deserialize };
use std::fmt;

pub type ChatId = i64;
pub type UserId = i64;

pub const IMAGE_PLACEHOLDER: &str = "<image>";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One typed part of a multimodal message, in the OpenAI wire shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")] Text {
        text: String,
    },
    #[serde(rename = "image_url")] ImageUrl {
        image_url: ImageUrl,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl { image_url: ImageUrl { url: url.into() } }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ContentPart::Text { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    pub fn is_text(&self) -> bool {
        matches!(self, Content::Text(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text.as_str()),
            Content::Parts(_) => None,
        }
    }

    /// Text form with every non-text message collapsed to the image placeholder.
    pub fn redacted(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(_) => IMAGE_PLACEHOLDER.to_string(),
        }
    }

    /// Log-friendly single-line preview.
    pub fn preview(&self) -> String {
        match self {
            Content::Text(text) => text.replace('\n', " ").chars().take(40).collect(),
            Content::Parts(_) => IMAGE_PLACEHOLDER.to_string(),
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_label: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            role,
            content: content.into(),
            author_label: None,
        }
    }

    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_author(mut self, label: impl Into<String>) -> Self {
        self.author_label = Some(label.into());
        self
    }
}

/// A usage event the store records as a side effect of persisting a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub user_id: UserId,
    pub stream: String,
    /// Events of this stream older than this many seconds may be pruned.
    /// Zero keeps them.
    #[serde(default)]
    pub retention: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub record_id: String,
    pub message: Message,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageEvent>,
    pub timestamp: i64,
}

impl StoredMessage {
    pub fn new(message: Message) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            message,
            user_id: None,
            model_id: None,
            system_prompt: None,
            usage: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}
