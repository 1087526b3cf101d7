use serde::Deserialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::Path;
use log::{ info, warn };

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Character {
    pub system_prompt: String,
    pub short_name: String,
}

pub type CharacterCatalogue = BTreeMap<String, Character>;

/// A missing file is not an error: the bot simply offers no characters.
pub fn load_characters(
    path: Option<&str>
) -> Result<CharacterCatalogue, Box<dyn Error + Send + Sync>> {
    let path = match path {
        Some(p) if !p.trim().is_empty() => p,
        _ => {
            return Ok(CharacterCatalogue::new());
        }
    };
    if !Path::new(path).exists() {
        warn!("Characters file '{}' not found; no characters loaded", path);
        return Ok(CharacterCatalogue::new());
    }
    let file_content = fs
        ::read_to_string(path)
        .map_err(|e| format!("Failed to read characters file '{}': {}", path, e))?;
    let characters: CharacterCatalogue = serde_json
        ::from_str(&file_content)
        .map_err(|e| format!("Failed to parse characters file '{}': {}", path, e))?;
    info!("Loaded {} character(s) from {}", characters.len(), path);
    Ok(characters)
}
