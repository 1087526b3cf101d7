use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::ChatBackend;
use crate::error::BackendError;
use crate::llm::ParamMap;
use crate::models::chat::Message;

/// Scripted backend: answers are served in order; once the script runs dry
/// every call fails.
#[derive(Default)]
pub struct MockBackend {
    answers: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<(Vec<Message>, ParamMap)>>,
    image_prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answers(answers: &[&str]) -> Self {
        let mock = Self::new();
        for a in answers {
            mock.push_answer(a);
        }
        mock
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_answer(&self, answer: &str) {
        self.answers.lock().unwrap().push_back(Ok(answer.to_string()));
    }

    pub fn push_failure(&self, reason: &str) {
        self.answers.lock().unwrap().push_back(Err(reason.to_string()));
    }

    pub fn calls(&self) -> Vec<(Vec<Message>, ParamMap)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn image_prompts(&self) -> Vec<String> {
        self.image_prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn complete(
        &self,
        messages: &[Message],
        params: &ParamMap
    ) -> Result<String, BackendError> {
        self.calls.lock().unwrap().push((messages.to_vec(), params.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.answers.lock().unwrap().pop_front();
        match next {
            Some(Ok(answer)) => Ok(answer),
            Some(Err(reason)) => Err(BackendError::Other(reason)),
            None => Err(BackendError::Other("script exhausted".to_string())),
        }
    }

    async fn generate_image(&self, prompt: &str, _image_model: &str) -> Result<String, BackendError> {
        self.image_prompts.lock().unwrap().push(prompt.to_string());
        Ok("https://images.example/generated.png".to_string())
    }

    async fn fetch_image(&self, _url: &str) -> Result<Vec<u8>, BackendError> {
        Ok(vec![0xff, 0xd8, 0xff])
    }

    fn get_model(&self) -> String {
        "mock".to_string()
    }

    fn get_base_url(&self) -> Option<String> {
        None
    }
}
