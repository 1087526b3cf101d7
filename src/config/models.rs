use serde::Deserialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::sync::Arc;
use log::info;

use crate::error::{ EngineError, EngineResult };
use crate::llm::{ BackendFamily, ParamMap };

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimit {
    pub limit: u64,
    /// Trailing window in seconds.
    pub interval: u64,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub standard: TierLimit,
    #[serde(alias = "premium")]
    pub subscribed: TierLimit,
}

impl TierLimits {
    /// Longest window any tier looks back over.
    pub fn longest_interval(&self) -> u64 {
        self.standard.interval.max(self.subscribed.interval)
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            standard: TierLimit { limit: 10000, interval: 31536000 },
            subscribed: TierLimit { limit: 100000, interval: 31536000 },
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct ParamRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ParamRange {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Turn template of a locally served model, rendered once per message.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChatTemplate {
    #[serde(default = "default_turn_template")]
    pub turn: String,
    #[serde(default = "default_generation_prompt")]
    pub generation_prompt: String,
    #[serde(default = "default_template_encoding")]
    pub encoding: String,
}

fn default_turn_template() -> String {
    "<|im_start|>{role}\n{content}<|im_end|>\n".to_string()
}

fn default_generation_prompt() -> String {
    "<|im_start|>assistant\n".to_string()
}

fn default_template_encoding() -> String {
    "cl100k_base".to_string()
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self {
            turn: default_turn_template(),
            generation_prompt: default_generation_prompt(),
            encoding: default_template_encoding(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
struct ModelEntry {
    #[serde(default)]
    model_name: String,
    family: BackendFamily,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_key_env: Option<String>,
    #[serde(default)]
    can_handle_images: bool,
    #[serde(default)]
    can_handle_tools: bool,
    #[serde(default)]
    system_prompt: String,
    #[serde(default)]
    params: ParamMap,
    #[serde(default)]
    param_ranges: BTreeMap<String, ParamRange>,
    #[serde(default)]
    message_count_limit: TierLimits,
    #[serde(default)]
    chat_template: Option<ChatTemplate>,
}

#[derive(Debug, Clone)]
pub struct ModelProfile {
    pub id: String,
    pub backend_model_name: String,
    pub family: BackendFamily,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub can_handle_images: bool,
    pub can_handle_tools: bool,
    pub default_system_prompt: String,
    pub default_params: ParamMap,
    pub param_ranges: BTreeMap<String, ParamRange>,
    pub limits: TierLimits,
    pub chat_template: ChatTemplate,
}

impl ModelProfile {
    /// Minimal profile, mostly useful for wiring tests.
    pub fn new(id: &str, backend_model_name: &str, family: BackendFamily) -> Self {
        Self {
            id: id.to_string(),
            backend_model_name: backend_model_name.to_string(),
            family,
            base_url: None,
            api_key: None,
            can_handle_images: false,
            can_handle_tools: false,
            default_system_prompt: String::new(),
            default_params: ParamMap::new(),
            param_ranges: BTreeMap::new(),
            limits: TierLimits::default(),
            chat_template: ChatTemplate::default(),
        }
    }

    fn from_entry(id: &str, entry: ModelEntry) -> EngineResult<Self> {
        if entry.model_name.trim().is_empty() {
            return Err(
                EngineError::Configuration(format!("model '{}' has no model_name", id))
            );
        }
        let api_key = entry.api_key.or_else(|| {
            entry.api_key_env.as_deref().and_then(|var| std::env::var(var).ok())
        });
        Ok(Self {
            id: id.to_string(),
            backend_model_name: entry.model_name,
            family: entry.family,
            base_url: entry.base_url,
            api_key,
            can_handle_images: entry.can_handle_images,
            can_handle_tools: entry.can_handle_tools,
            default_system_prompt: entry.system_prompt,
            default_params: entry.params,
            param_ranges: entry.param_ranges,
            limits: entry.message_count_limit,
            chat_template: entry.chat_template.unwrap_or_default(),
        })
    }

    /// Rejects numeric parameters outside the ranges this backend accepts.
    pub fn validate_params(&self, params: &ParamMap) -> EngineResult<()> {
        for (name, range) in &self.param_ranges {
            let value = match params.get(name).and_then(|v| v.as_f64()) {
                Some(v) => v,
                None => {
                    continue;
                }
            };
            if !range.contains(value) {
                return Err(
                    EngineError::UnsupportedContent(
                        format!("{} = {} is not accepted by model '{}'", name, value, self.id)
                    )
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ModelRegistry {
    profiles: BTreeMap<String, Arc<ModelProfile>>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new(
        profiles: Vec<ModelProfile>,
        default_model: Option<&str>
    ) -> EngineResult<Self> {
        if profiles.is_empty() {
            return Err(EngineError::Configuration("model catalogue is empty".to_string()));
        }
        let mut map = BTreeMap::new();
        for profile in profiles {
            if profile.backend_model_name.trim().is_empty() {
                return Err(
                    EngineError::Configuration(format!("model '{}' has no model_name", profile.id))
                );
            }
            map.insert(profile.id.clone(), Arc::new(profile));
        }
        let default_model = match default_model {
            Some(id) if map.contains_key(id) => id.to_string(),
            Some(id) => {
                return Err(
                    EngineError::Configuration(format!("default model '{}' is not in the catalogue", id))
                );
            }
            None =>
                map
                    .keys()
                    .next()
                    .cloned()
                    .ok_or_else(|| EngineError::Configuration("model catalogue is empty".to_string()))?,
        };
        Ok(Self { profiles: map, default_model })
    }

    pub fn from_json(json: &str, default_model: Option<&str>) -> EngineResult<Self> {
        let entries: BTreeMap<String, ModelEntry> = serde_json
            ::from_str(json)
            .map_err(|e| EngineError::Configuration(format!("invalid model catalogue: {}", e)))?;
        let profiles = entries
            .into_iter()
            .map(|(id, entry)| ModelProfile::from_entry(&id, entry))
            .collect::<EngineResult<Vec<_>>>()?;
        Self::new(profiles, default_model)
    }

    pub fn resolve(&self, model_id: &str) -> EngineResult<Arc<ModelProfile>> {
        self.profiles
            .get(model_id)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedModel(model_id.to_string()))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.profiles.contains_key(model_id)
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Arc<ModelProfile>> {
        self.profiles.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }
}

pub fn load_models(
    path: &str,
    default_model: Option<&str>
) -> Result<Arc<ModelRegistry>, Box<dyn Error + Send + Sync>> {
    let file_content = fs
        ::read_to_string(path)
        .map_err(|e| format!("Failed to read model catalogue '{}': {}", path, e))?;
    let registry = ModelRegistry::from_json(&file_content, default_model)?;
    info!(
        "Loaded {} model profile(s) from {}; default model: {}",
        registry.profiles.len(),
        path,
        registry.default_model
    );
    Ok(Arc::new(registry))
}
