use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Model Catalogue Args ---
    /// Path to the JSON model catalogue keyed by model id
    #[arg(long, env = "MODELS_PATH", default_value = "json/models.json")]
    pub models_path: String,

    /// Model used by chats that never picked one. Defaults to the first catalogue id.
    #[arg(long, env = "DEFAULT_MODEL")]
    pub default_model: Option<String>,

    /// Optional JSON file with character presets (system prompt + short name)
    #[arg(long, env = "CHARACTERS_PATH")]
    pub characters_path: Option<String>,

    /// Optional override of the tool-selection instruction template
    #[arg(long, env = "TOOLS_PROMPT_PATH")]
    pub tools_prompt_path: Option<String>,

    // --- Store Args ---
    /// Chat state store type (memory, redis)
    #[arg(long, env = "STORE_TYPE", default_value = "memory")]
    pub store_type: String,

    /// Store host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "STORE_HOST", default_value = "redis://127.0.0.1:6379")]
    pub store_host: String,

    /// Prefix for Redis keys.
    #[arg(long, env = "STORE_REDIS_PREFIX", default_value = "conductor:")]
    pub store_redis_prefix: String,

    // --- Engine Args ---
    /// Token budget of the context sent to a backend
    #[arg(long, env = "HISTORY_MAX_TOKENS", default_value = "6144")]
    pub history_max_tokens: usize,

    /// Maximum characters per delivered answer part
    #[arg(long, env = "CHUNK_SIZE", default_value = "3500")]
    pub chunk_size: usize,

    /// Username the bot is mentioned by in multi-party chats (without '@')
    #[arg(long, env = "BOT_USERNAME")]
    pub bot_username: Option<String>,

    /// Name the bot answers to unless a chat sets its own
    #[arg(long, env = "BOT_SHORT_NAME", default_value = "Conductor")]
    pub bot_short_name: String,

    /// Seconds before a backend call is abandoned as failed
    #[arg(long, env = "BACKEND_TIMEOUT_SECS", default_value = "120")]
    pub backend_timeout_secs: u64,

    // --- Tool Args ---
    /// Image model used by the image tool
    #[arg(long, env = "IMAGE_MODEL", default_value = "dall-e-3")]
    pub image_model: String,

    /// Generated images per user per rolling 24 hours
    #[arg(long, env = "IMAGE_DAILY_LIMIT", default_value = "5")]
    pub image_daily_limit: u64,

    /// Number of recent messages shown to the tool-selection call
    #[arg(long, env = "TOOL_HISTORY_TURNS", default_value = "4")]
    pub tool_history_turns: usize,

    // --- Server Args ---
    /// WebSocket listen address
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// API key clients must pass as `?key=`. Unset means no check.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Enable debug logging
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}
