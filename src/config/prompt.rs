use std::error::Error;
use std::fmt;
use std::fs;
use log::info;

pub const DEFAULT_TOOLS_TEMPLATE: &str =
    r#"
## Tools that are available to you

{tool_descriptions}

## Conversation

{conversation}

## Task
Call tools based on the last user message. All other messages are just for the context.
Do not call tools when it is not needed.
Return a tool call in the appropriate format. If no tool calls are needed, return {"tools": {}}
"#;

#[derive(Debug)]
pub enum PromptError {
    MissingPlaceholder(String),
    IoError(std::io::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::MissingPlaceholder(key) =>
                write!(f, "Tools prompt template is missing the '{}' placeholder", key),
            PromptError::IoError(e) => write!(f, "Tools prompt file IO error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

#[derive(Debug, Clone)]
pub struct ToolsPrompt {
    template: String,
}

impl Default for ToolsPrompt {
    fn default() -> Self {
        Self { template: DEFAULT_TOOLS_TEMPLATE.to_string() }
    }
}

impl ToolsPrompt {
    pub fn new(template: String) -> Result<Self, PromptError> {
        for key in ["{tool_descriptions}", "{conversation}"] {
            if !template.contains(key) {
                return Err(PromptError::MissingPlaceholder(key.to_string()));
            }
        }
        Ok(Self { template })
    }

    pub fn render(&self, tool_descriptions: &str, conversation: &str) -> String {
        self.template
            .replace("{tool_descriptions}", tool_descriptions)
            .replace("{conversation}", conversation)
    }
}

pub fn load_tools_prompt(path: Option<&str>) -> Result<ToolsPrompt, PromptError> {
    match path {
        Some(p) if !p.trim().is_empty() => {
            let template = fs::read_to_string(p)?;
            info!("Loaded tools prompt template from: {}", p);
            ToolsPrompt::new(template)
        }
        _ => Ok(ToolsPrompt::default()),
    }
}
