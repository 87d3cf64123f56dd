use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

const DEFAULT_CLAUDE_BIN: &str = "claude";
const DEFAULT_DEVCONTAINER_BIN: &str = "devcontainer";
const DEFAULT_UPDATE_INTERVAL_MS: u64 = 1000;
const DEFAULT_LOG_WINDOW_LINES: usize = 20;

// ─── ClaudeConfig ─────────────────────────────────────────────────────────────

/// Invocation settings for the claude CLI (`[claude]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClaudeConfig {
    /// Binary name or path used to spawn the assistant subprocess.
    pub bin: String,
    /// Pass `--dangerously-skip-permissions` on every turn. Off unless
    /// explicitly enabled.
    pub dangerously_skip_permissions: bool,
    /// Fixed suffix appended to the system prompt via
    /// `--append-system-prompt=...`. None = flag omitted.
    pub append_system_prompt: Option<String>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            bin: DEFAULT_CLAUDE_BIN.to_string(),
            dangerously_skip_permissions: false,
            append_system_prompt: None,
        }
    }
}

// ─── EnvironmentConfig ────────────────────────────────────────────────────────

/// Devcontainer provisioning settings (`[environment]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Binary name or path for the devcontainer CLI.
    pub bin: String,
    /// Maximum provisioning log lines kept in the rolling window.
    pub log_window_lines: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            bin: DEFAULT_DEVCONTAINER_BIN.to_string(),
            log_window_lines: DEFAULT_LOG_WINDOW_LINES,
        }
    }
}

// ─── ProgressConfig ───────────────────────────────────────────────────────────

/// Progress streaming settings (`[progress]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Minimum milliseconds between coalesced progress emissions.
    pub update_interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
        }
    }
}

// ─── BotConfig ────────────────────────────────────────────────────────────────

/// Top-level daemon configuration, loaded from `<data_dir>/config.toml`.
/// Missing file or missing sections fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BotConfig {
    pub claude: ClaudeConfig,
    pub environment: EnvironmentConfig,
    pub progress: ProgressConfig,
}

impl BotConfig {
    /// Load configuration from `config.toml` in the data directory.
    /// A missing file is not an error; a malformed file is logged and
    /// replaced by defaults rather than aborting startup.
    pub async fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("config.toml");
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match toml::from_str::<BotConfig>(&raw) {
                Ok(cfg) => {
                    info!(path = %path.display(), "loaded config");
                    cfg
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed config, using defaults");
                    BotConfig::default()
                }
            },
            Err(_) => BotConfig::default(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
