pub mod agent;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod content;
pub mod context;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod quota;
pub mod server;
pub mod settings;
pub mod tools;

use agent::ConversationOrchestrator;
use cli::Args;
use config::characters::load_characters;
use log::info;
use server::Server;
use settings::ChatSettings;
use std::error::Error;
use std::sync::Arc;

pub fn log_configuration(args: &Args) {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("API Key Required: {}", args.server_api_key.as_deref().map_or(false, |k| !k.is_empty()));
    info!("Models Path: {}", args.models_path);
    info!("Default Model: {}", args.default_model.as_deref().unwrap_or("first in catalogue"));
    info!("Characters Path: {}", args.characters_path.as_deref().unwrap_or("none"));
    info!("Tools Prompt Path: {}", args.tools_prompt_path.as_deref().unwrap_or("built-in"));
    info!("Store Type: {}", args.store_type);
    info!("Store Host: {}", args.store_host);
    info!("Store Redis Prefix: {}", args.store_redis_prefix);
    info!("History Max Tokens: {}", args.history_max_tokens);
    info!("Chunk Size: {}", args.chunk_size);
    info!("Bot Username: {}", args.bot_username.as_deref().unwrap_or("none"));
    info!("Bot Short Name: {}", args.bot_short_name);
    info!("Backend Timeout: {}s", args.backend_timeout_secs);
    info!("Image Model: {}", args.image_model);
    info!("Image Daily Limit: {}", args.image_daily_limit);
    info!("Tool History Turns: {}", args.tool_history_turns);
    info!("-------------------------");
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    log_configuration(&args);

    let engine = Arc::new(ConversationOrchestrator::from_args(&args).await?);
    let characters = load_characters(args.characters_path.as_deref())?;
    let settings = Arc::new(ChatSettings::new(engine.clone(), characters));

    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, engine, settings, args.server_api_key.clone());
    server.run().await?;

    Ok(())
}
