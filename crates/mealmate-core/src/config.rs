// Configuration loading and parsing (client.toml, credentials.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub realtime: RealtimeConfig,
    pub chat: ChatConfig,
    pub polling: PollingConfig,
    pub credentials: CredentialsConfig,
}

// ---------------------------------------------------------------------------
// client.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire client.toml file.
#[derive(Debug, Clone, Deserialize)]
struct ClientFile {
    api: ApiConfig,
    realtime: RealtimeConfig,
    #[serde(default)]
    chat: ChatConfig,
    #[serde(default)]
    polling: PollingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Origin of the REST API, e.g. `https://mealmate.example`.
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket endpoint speaking STOMP, e.g. `wss://mealmate.example/ws`.
    pub ws_url: String,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl RealtimeConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub page_size: u32,
    pub read_debounce_ms: u64,
    pub read_retry_ms: u64,
    pub duplicate_window_ms: u64,
    pub notice_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            page_size: 30,
            read_debounce_ms: 120,
            read_retry_ms: 3000,
            duplicate_window_ms: 400,
            notice_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval for the wait screens (vote wait, settlement wait, OCR loading).
    pub fixed_interval_ms: u64,
    pub voting_interval_ms: u64,
    pub settling_interval_ms: u64,
    pub idle_interval_ms: u64,
}

impl PollingConfig {
    pub fn fixed_interval(&self) -> Duration {
        Duration::from_millis(self.fixed_interval_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            fixed_interval_ms: 3000,
            voting_interval_ms: 3000,
            settling_interval_ms: 5000,
            idle_interval_ms: 15000,
        }
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    /// Raw `name=value` session cookie imported from a browser login.
    pub session_cookie: Option<String>,
}

fn default_timeout_secs() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/client.toml` and
/// (optionally) `config/credentials.toml`, relative to `base_dir`.
///
/// Does not copy defaults; `load_config()` handles that.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- client.toml (required) ---
    let client_path = config_dir.join("client.toml");
    let client_text = read_file(&client_path)?;
    let client: ClientFile =
        toml::from_str(&client_text).map_err(|e| ConfigError::ParseError {
            path: client_path.clone(),
            source: e,
        })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        api: client.api,
        realtime: client.realtime,
        chat: client.chat,
        polling: client.polling,
        credentials,
    };

    validate(&config)?;

    Ok(config)
}

/// Seed `config/` from `defaults/`, never overwriting a file the user has
/// already put in place. Template files ending in `.example` stay behind.
/// Returns the seeded paths in name order.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    match (defaults_dir.is_dir(), config_dir.is_dir()) {
        (true, _) => {}
        (false, true) => return Ok(Vec::new()),
        (false, false) => {
            return Err(seed_error(format!(
                "neither defaults/ nor config/ directory found in {}; \
                 start from the directory holding defaults/",
                base_dir.display()
            )))
        }
    }

    std::fs::create_dir_all(&config_dir)
        .map_err(|e| seed_error(format!("cannot create {}: {e}", config_dir.display())))?;

    let mut templates: Vec<PathBuf> = std::fs::read_dir(&defaults_dir)
        .and_then(|entries| {
            entries
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<_>>()
        })
        .map_err(|e| seed_error(format!("cannot list {}: {e}", defaults_dir.display())))?;
    templates.retain(|path| path.is_file() && !is_example(path));
    templates.sort();

    let mut seeded = Vec::new();
    for source in templates {
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = config_dir.join(name);
        let wrote = copy_if_missing(&source, &target).map_err(|e| {
            seed_error(format!("cannot seed {} from {}: {e}", target.display(), source.display()))
        })?;
        if wrote {
            seeded.push(target);
        }
    }

    Ok(seeded)
}

fn seed_error(message: String) -> ConfigError {
    ConfigError::DefaultsCopyError { message }
}

fn is_example(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "example")
}

/// Copy `source` to `target` unless `target` exists. The existence check and
/// the create are one atomic step.
fn copy_if_missing(source: &Path, target: &Path) -> std::io::Result<bool> {
    let mut dest = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    let mut src = std::fs::File::open(source)?;
    std::io::copy(&mut src, &mut dest)?;
    Ok(true)
}

/// Convenience wrapper: loads config relative to the current working directory,
/// copying default config files first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let base = &config.api.base_url;
    match reqwest::Url::parse(base) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        _ => {
            return Err(ConfigError::ValidationError {
                field: "api.base_url".into(),
                message: format!("must be an http(s) URL, got {base:?}"),
            });
        }
    }

    let ws = &config.realtime.ws_url;
    match reqwest::Url::parse(ws) {
        Ok(url) if url.scheme() == "ws" || url.scheme() == "wss" => {}
        _ => {
            return Err(ConfigError::ValidationError {
                field: "realtime.ws_url".into(),
                message: format!("must be a ws(s) URL, got {ws:?}"),
            });
        }
    }

    if config.chat.page_size == 0 {
        return Err(ConfigError::ValidationError {
            field: "chat.page_size".into(),
            message: "must be greater than 0".into(),
        });
    }

    let duration_fields: &[(&str, u64)] = &[
        ("api.timeout_secs", config.api.timeout_secs),
        ("realtime.reconnect_delay_ms", config.realtime.reconnect_delay_ms),
        ("realtime.heartbeat_interval_ms", config.realtime.heartbeat_interval_ms),
        ("chat.read_debounce_ms", config.chat.read_debounce_ms),
        ("chat.read_retry_ms", config.chat.read_retry_ms),
        ("chat.duplicate_window_ms", config.chat.duplicate_window_ms),
        ("chat.notice_ms", config.chat.notice_ms),
        ("polling.fixed_interval_ms", config.polling.fixed_interval_ms),
        ("polling.voting_interval_ms", config.polling.voting_interval_ms),
        ("polling.settling_interval_ms", config.polling.settling_interval_ms),
        ("polling.idle_interval_ms", config.polling.idle_interval_ms),
    ];
    for (name, val) in duration_fields {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
