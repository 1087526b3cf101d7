use async_trait::async_trait;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;

use super::ChatBackend;
use crate::config::models::ModelProfile;
use crate::error::BackendError;
use crate::llm::ParamMap;
use crate::models::chat::{ Content, Message };

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for any backend speaking the OpenAI chat-completions protocol
/// (OpenAI itself, Anthropic's compatibility endpoint, vLLM/llama.cpp servers).
pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct OpenAIMessage {
    role: String,
    content: Content,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage>,
    #[serde(flatten)]
    params: &'a ParamMap,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIAnswer,
}

#[derive(Deserialize)]
struct OpenAIAnswer {
    content: Option<String>,
}

#[derive(Serialize)]
struct OpenAIImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    size: &'a str,
    quality: &'a str,
    n: u32,
}

#[derive(Deserialize)]
struct OpenAIImageResponse {
    data: Vec<OpenAIImageData>,
}

#[derive(Deserialize)]
struct OpenAIImageData {
    url: Option<String>,
}

// Author labels are engine-side framing only and never leave the process.
fn to_wire_messages(messages: &[Message]) -> Vec<OpenAIMessage> {
    messages
        .iter()
        .map(|m| OpenAIMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        })
        .collect()
}

impl OpenAIChatClient {
    pub fn new(
        api_key: Option<String>,
        model: String,
        base_url: Option<String>
    ) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let api_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|e|
                    format!("Invalid API key format: {}", e)
                )?
            );
        }

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Box::new(e) as Box<dyn StdError + Send + Sync>)?;

        Ok(Self {
            http,
            model,
            base_url: api_url,
        })
    }

    pub fn from_profile(profile: &ModelProfile) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        Self::new(
            profile.api_key.clone(),
            profile.backend_model_name.clone(),
            profile.base_url.clone()
        )
    }

    fn endpoint(&self, route: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), route)
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        route: &str,
        body: &T
    ) -> Result<reqwest::Response, BackendError> {
        let resp = self.http.post(self.endpoint(route)).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status { status: status.as_u16(), body });
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatBackend for OpenAIChatClient {
    async fn complete(
        &self,
        messages: &[Message],
        params: &ParamMap
    ) -> Result<String, BackendError> {
        let req = OpenAIChatRequest {
            model: &self.model,
            messages: to_wire_messages(messages),
            params,
        };

        let resp = self.post_json("/chat/completions", &req).await?.json::<OpenAIResponse>().await?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or(BackendError::EmptyResponse)
    }

    async fn generate_image(&self, prompt: &str, image_model: &str) -> Result<String, BackendError> {
        let req = OpenAIImageRequest {
            model: image_model,
            prompt,
            size: "1024x1024",
            quality: "standard",
            n: 1,
        };

        let resp = self
            .post_json("/images/generations", &req).await?
            .json::<OpenAIImageResponse>().await?;

        resp.data
            .into_iter()
            .next()
            .and_then(|d| d.url)
            .ok_or(BackendError::EmptyResponse)
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let bytes = reqwest::get(url).await?.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}
