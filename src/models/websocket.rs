use serde::{ Serialize, Deserialize };

use crate::history::FeedbackKind;
use crate::models::chat::{ ChatId, UserId };

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "turn")] Turn {
        chat_id: ChatId,
        user_id: UserId,
        #[serde(default)]
        user_name: Option<String>,
        #[serde(default)]
        multi_party: bool,
        #[serde(default)]
        reply_to_bot: bool,
        #[serde(default)]
        text: Option<String>,
        /// Base64 image bytes; a photo, or a document when `file_name` is set.
        #[serde(default)]
        image_base64: Option<String>,
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
    },
    #[serde(rename = "feedback")] Feedback {
        user_id: UserId,
        message_id: i64,
        kind: FeedbackKind,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "processing")] Processing {
        chat_id: ChatId,
    },
    #[serde(rename = "chunk")] Chunk {
        chat_id: ChatId,
        index: usize,
        content: String,
        last: bool,
        /// Set on the final chunk: the client may offer like/dislike.
        feedback: bool,
        backend: String,
        timestamp: i64,
    },
    #[serde(rename = "image")] Image {
        chat_id: ChatId,
        caption: String,
        url: Option<String>,
        backend: String,
        timestamp: i64,
    },
    #[serde(rename = "rejected")] Rejected {
        chat_id: ChatId,
        message: String,
    },
    #[serde(rename = "failed")] Failed {
        chat_id: ChatId,
        message: String,
    },
    #[serde(rename = "recorded")] Recorded {
        chat_id: ChatId,
    },
    #[serde(rename = "feedback_saved")]
    FeedbackSaved,
    #[serde(rename = "error")] Error {
        message: String,
    },
}
