use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::info;

use super::{ Tool, ToolArguments, ToolOutput };
use crate::config::models::TierLimit;
use crate::error::BackendError;
use crate::llm::chat::ChatBackend;
use crate::models::chat::{ Content, ContentPart };

const DAY_SECONDS: u64 = 86400;

pub fn jpeg_data_uri(bytes: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(bytes))
}

/// Generates an image from a detailed prompt. The stored answer embeds the
/// image bytes so history never points at an expiring URL.
pub struct ImageTool {
    image_model: String,
    daily_limit: u64,
}

impl ImageTool {
    pub fn new(image_model: &str, daily_limit: u64) -> Self {
        Self {
            image_model: image_model.to_string(),
            daily_limit,
        }
    }
}

#[async_trait]
impl Tool for ImageTool {
    fn name(&self) -> &str {
        "image"
    }

    fn description(&self) -> String {
        [
            "Whenever a description of an image is given, create a prompt that an image model can use to generate the image.",
            "The generated prompt should be very detailed, and around 100 words long.",
            "The caption is a short title in the language of the user.",
            r#"Output a JSON in the following format: {"tools": {"image": {"prompt": "...", "caption": "..."}}}"#,
        ].join("\n")
    }

    fn required_arguments(&self) -> &[&'static str] {
        &["prompt"]
    }

    fn quota(&self) -> TierLimit {
        TierLimit { limit: self.daily_limit, interval: DAY_SECONDS }
    }

    async fn execute(
        &self,
        backend: &dyn ChatBackend,
        arguments: &ToolArguments
    ) -> Result<ToolOutput, BackendError> {
        let prompt = arguments
            .get("prompt")
            .ok_or_else(|| BackendError::Other("image prompt is missing".to_string()))?;
        let caption = arguments
            .get("caption")
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(prompt)
            .clone();

        let image_url = backend.generate_image(prompt, &self.image_model).await?;
        info!("Image generated with {}: {}", self.image_model, image_url);
        let bytes = backend.fetch_image(&image_url).await?;

        let content = Content::Parts(
            vec![ContentPart::text(caption.clone()), ContentPart::image(jpeg_data_uri(&bytes))]
        );
        Ok(ToolOutput {
            caption,
            image_url: Some(image_url),
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::mock::MockBackend;

    #[test]
    fn test_data_uri() {
        assert_eq!(jpeg_data_uri(&[0xff, 0xd8, 0xff]), "data:image/jpeg;base64,/9j/");
    }

    #[tokio::test]
    async fn test_caption_falls_back_to_prompt() {
        let backend = MockBackend::new();
        let tool = ImageTool::new("dall-e-3", 5);
        let mut args = ToolArguments::new();
        args.insert("prompt".into(), "a lighthouse at dusk".into());

        let output = tool.execute(&backend, &args).await.unwrap();
        assert_eq!(output.caption, "a lighthouse at dusk");
        assert_eq!(
            output.content,
            Content::Parts(
                vec![
                    ContentPart::text("a lighthouse at dusk"),
                    ContentPart::image("data:image/jpeg;base64,/9j/")
                ]
            )
        );
        assert_eq!(tool.quota(), TierLimit { limit: 5, interval: 86400 });
    }
}
