//! Configuration management for the Bitfinex bot

use crate::services::bitfinex::DEFAULT_REST_URL;
use crate::services::private_ws::DEFAULT_WS_URL;
use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};

/// Default bracket state file name, resolved under the config directory
const DEFAULT_STATE_FILE: &str = "bracket_state.json";

/// Bot configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Bitfinex API key (only for live trading)
    pub api_key: Option<String>,
    pub api_secret: Option<String>,

    /// REST base URL
    pub rest_url: String,

    /// WebSocket URL for the authenticated stream
    pub ws_url: String,

    /// Whether running in paper trading mode
    pub paper_trading: bool,

    /// Trade from the exchange wallet (`EXCHANGE *` order types) instead of margin
    pub exchange_wallet: bool,

    /// Ask Bitfinex to cancel all orders if the private socket drops
    pub dead_man_switch: bool,

    /// HTTP request timeout in seconds
    pub http_timeout_seconds: u64,

    /// Bracket manager settings
    pub bracket: BracketConfig,
}

#[derive(Debug, Clone)]
pub struct BracketConfig {
    /// Shrink the surviving exit leg by the filled amount before cancelling it
    pub partial_adjust: bool,
    /// Absolute path of the persisted group store
    pub state_file: PathBuf,
}

impl BracketConfig {
    /// Same settings, but a separate state file so paper runs never touch live state
    pub fn for_paper(&self) -> Self {
        Self {
            partial_adjust: self.partial_adjust,
            state_file: self.state_file.with_extension("paper.json"),
        }
    }
}

/// Relative state paths live under the config directory
pub fn resolve_state_path(raw: &str, config_dir: &Path) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        config_dir.join(path)
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let api_key = env::var("BFX_API_KEY").ok().filter(|s| !s.is_empty());
        let api_secret = env::var("BFX_API_SECRET").ok().filter(|s| !s.is_empty());

        let rest_url = env::var("BFX_REST_URL").unwrap_or_else(|_| DEFAULT_REST_URL.to_string());
        let ws_url = env::var("BFX_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());

        // Default to paper trading for safety
        let paper_trading = env_flag("PAPER_TRADING", true);
        let exchange_wallet = env_flag("BFX_EXCHANGE_WALLET", true);
        let dead_man_switch = env_flag("BFX_DEAD_MAN_SWITCH", false);

        let http_timeout_seconds = env::var("HTTP_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let config_dir = match env::var("CONFIG_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from("config"),
        };
        let config_dir = if config_dir.is_absolute() {
            config_dir
        } else {
            env::current_dir()?.join(config_dir)
        };

        let state_file = env::var("BRACKET_STATE_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_STATE_FILE.to_string());

        let bracket = BracketConfig {
            partial_adjust: env_flag("BRACKET_PARTIAL_ADJUST", false),
            state_file: resolve_state_path(&state_file, &config_dir),
        };

        // Validate configuration
        if !paper_trading && (api_key.is_none() || api_secret.is_none()) {
            anyhow::bail!("BFX_API_KEY and BFX_API_SECRET required for live trading");
        }

        Ok(Self {
            api_key,
            api_secret,
            rest_url,
            ws_url,
            paper_trading,
            exchange_wallet,
            dead_man_switch,
            http_timeout_seconds,
            bracket,
        })
    }

    /// Check if live trading is enabled
    pub fn is_live(&self) -> bool {
        !self.paper_trading && self.api_key.is_some() && self.api_secret.is_some()
    }

    /// Bracket settings for the current mode
    pub fn active_bracket_config(&self) -> BracketConfig {
        if self.is_live() {
            self.bracket.clone()
        } else {
            self.bracket.for_paper()
        }
    }
}
