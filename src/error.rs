use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaKind {
    Standard,
    Premium,
    Tool(String),
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::Standard => write!(f, "standard"),
            QuotaKind::Premium => write!(f, "premium"),
            QuotaKind::Tool(name) => write!(f, "tool '{}'", name),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend transport error: {0}")] Http(#[from] reqwest::Error),
    #[error("backend returned status {status}: {body}")] Status {
        status: u16,
        body: String,
    },
    #[error("backend returned an empty answer")]
    EmptyResponse,
    #[error("backend call timed out after {0}s")] Timeout(u64),
    #[error("backend error: {0}")] Other(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")] Redis(#[from] redis::RedisError),
    #[error("stored record is not valid JSON: {0}")] Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")] Configuration(String),
    #[error("model '{0}' is no longer available")] UnsupportedModel(String),
    #[error("{0} quota exceeded")] QuotaExceeded(QuotaKind),
    #[error("unsupported content: {0}")] UnsupportedContent(String),
    #[error(transparent)] BackendFailure(#[from] BackendError),
    #[error(transparent)] Store(#[from] StoreError),
}

impl EngineError {
    pub fn is_user_caused(&self) -> bool {
        matches!(
            self,
            EngineError::UnsupportedModel(_) |
                EngineError::QuotaExceeded(_) |
                EngineError::UnsupportedContent(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
