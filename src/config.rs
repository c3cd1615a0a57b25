use clap::Parser;
use serde::Deserialize;

/// CLI flags, mirroring the teacher's `Args { mode, config }` split: a
/// config-file path plus a couple of process-level overrides.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value = "config.toml")]
    pub config: String,

    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub telegram: TelegramConfig,
    pub storage: StorageConfig,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub debug_mode: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub api_id: i32,
    pub api_hash: String,
    pub bot_token: String,
    pub helper_bot_token: String,
    #[serde(default)]
    pub multi_tokens: Vec<String>,
    #[serde(default)]
    pub owner_id: Option<i64>,
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_json_path")]
    pub json_path: String,
    #[serde(default = "default_mongo_db")]
    pub mongo_db: String,
}

fn default_json_path() -> String {
    "playlists.json".to_string()
}

fn default_mongo_db() -> String {
    "archivelive".to_string()
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Json,
    PostgresText,
    PostgresArray,
    Mongo,
}

/// One entry per `STREAM_DB_IDS` channel: `i -> streami`, the configured chat.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub chat_id: i64,
    #[serde(default)]
    pub reverse: bool,
}

impl Settings {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
