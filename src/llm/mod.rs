pub mod chat;
pub mod tokens;
use serde::{ Deserialize, Serialize };
use std::collections::BTreeMap;
use std::str::FromStr;
use std::fmt;

/// Generation parameters forwarded verbatim to a backend (temperature, top_p, ...).
pub type ParamMap = BTreeMap<String, serde_json::Value>;

/// Token-accounting family of a backend. Decides which counter a profile gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendFamily {
    OpenAI,
    Anthropic,
    Local,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseBackendFamilyError {
    message: String,
}

impl fmt::Display for ParseBackendFamilyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseBackendFamilyError {}
impl FromStr for BackendFamily {
    type Err = ParseBackendFamilyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(BackendFamily::OpenAI),
            "anthropic" => Ok(BackendFamily::Anthropic),
            "local" => Ok(BackendFamily::Local),
            _ =>
                Err(ParseBackendFamilyError {
                    message: format!("Invalid backend family: '{}'", s),
                }),
        }
    }
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendFamily::OpenAI => "openai",
            BackendFamily::Anthropic => "anthropic",
            BackendFamily::Local => "local",
        };
        write!(f, "{}", name)
    }
}
