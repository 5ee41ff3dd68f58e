use slog::Drain;
use std::env;
use std::path::PathBuf;

pub mod auth;
pub mod cache;
pub mod db;
pub mod genres;
pub mod models;
pub mod normalize;
pub mod service;
pub mod spotify;
pub mod utils;

pub type Error = Box<dyn std::error::Error>;
pub type Result<T> = std::result::Result<T, Error>;

/// "string error" - shorthand for building string errors
/// that convert into the crate error type.
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => { format!($($arg)*) };
}

pub fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    // The "base" logger that everything should branch off of
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = env_or("LOG_LEVEL", "INFO")
                .parse()
                .expect("invalid log_level");
        if env_or("LOG_FORMAT", "json").to_lowercase().trim() == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, slog::o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, slog::o!())
        }
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "spotlog"));
}

/// Runtime configuration. Loaded from the environment once per run in each
/// entry point, validated with `initialize`, then passed by reference into
/// the components that need it - immutable for the rest of the run.
#[derive(Debug, Clone)]
pub struct Config {
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub spotify_redirect_uri: String,
    pub page_limit: u32,
    pub token_file: PathBuf,
    pub db_url: String,
    pub auth_timeout_seconds: u64,
}
impl Config {
    pub fn load() -> Self {
        Self {
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", ""),
            spotify_client_secret: env_or("SPOTIFY_CLIENT_SECRET", ""),
            spotify_redirect_uri: env_or("SPOTIFY_REDIRECT_URI", "http://localhost:8888/callback"),
            page_limit: env_or("SPOTIFY_PAGE_LIMIT", "50")
                .parse()
                .expect("invalid page limit"),
            token_file: PathBuf::from(env_or("SPOTIFY_TOKEN_FILE", "env/token.json")),
            db_url: env_or("DATABASE_URL", "sqlite://spotify_log.db"),
            auth_timeout_seconds: env_or("AUTH_TIMEOUT_SECONDS", "120")
                .parse()
                .expect("invalid auth_timeout_seconds"),
        }
    }
    pub fn initialize(&self) -> anyhow::Result<()> {
        let mut missing = vec![];
        if self.spotify_client_id.is_empty() {
            missing.push("SPOTIFY_CLIENT_ID");
        }
        if self.spotify_client_secret.is_empty() {
            missing.push("SPOTIFY_CLIENT_SECRET");
        }
        if !missing.is_empty() {
            anyhow::bail!("missing env vars for spotify: {}", missing.join(", "));
        }
        slog::info!(
            LOG, "initialized config";
            "redirect_uri" => &self.spotify_redirect_uri,
            "page_limit" => self.page_limit,
            "db_url" => &self.db_url,
            "token_file" => self.token_file.display().to_string(),
        );
        Ok(())
    }
}
