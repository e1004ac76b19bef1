//! Configuration module - environment variable parsing and match configuration

mod match_config;

pub use match_config::{GameMode, MatchConfig, RoundSpec, SurvivalConfig, WaveSpec};

#[cfg(test)]
pub use match_config::test_support;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Path to the JSON match configuration
    pub match_config_path: PathBuf,

    /// Account-balance service base URL; rewards are only logged when unset
    pub accounts_url: Option<String>,
    /// Service key sent to the account-balance service
    pub accounts_service_key: Option<String>,

    /// HS256 secret for session tokens issued by the lobby service
    pub session_jwt_secret: String,

    /// Allowed client origins for CORS (comma-separated)
    pub client_origin: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let accounts_url = env::var("ACCOUNTS_URL").ok();
        let accounts_service_key = env::var("ACCOUNTS_SERVICE_KEY").ok();
        if accounts_url.is_some() && accounts_service_key.is_none() {
            return Err(ConfigError::Missing("ACCOUNTS_SERVICE_KEY"));
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            match_config_path: env::var("MATCH_CONFIG_PATH")
                .unwrap_or_else(|_| "match.json".to_string())
                .into(),

            accounts_url,
            accounts_service_key,

            session_jwt_secret: env::var("SESSION_JWT_SECRET")
                .map_err(|_| ConfigError::Missing("SESSION_JWT_SECRET"))?,

            client_origin: env::var("CLIENT_ORIGIN").ok(),
        })
    }
}

/// Configuration errors. All of them are fatal: a session is never started from a
/// configuration that failed to load or validate.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Failed to read match config {path}: {source}")]
    ReadMatchConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed match config: {0}")]
    ParseMatchConfig(#[from] serde_json::Error),

    #[error("Match config for {0:?} mode is missing its `{1}` section")]
    MissingModeSection(GameMode, &'static str),

    #[error("Survival config has no rounds")]
    NoRounds,

    #[error("Round {round} has no waves")]
    EmptyRound { round: usize },

    #[error("Round {round} wave {wave} spawns no units")]
    EmptyWave { round: usize, wave: usize },

    #[error("Round {round} base reward must be positive")]
    InvalidBaseReward { round: usize },

    #[error("Round {round} wave {wave} reward weight must be positive")]
    InvalidWaveWeight { round: usize, wave: usize },

    #[error("Map {0} has no spawn candidates")]
    NoSpawnCandidates(String),

    #[error("Participant limits are invalid (min {min}, max {max})")]
    InvalidParticipantLimits { min: usize, max: usize },
}
