//! DTEWorks Bot
//!
//! An HTTP-controlled automation bot for dteworks.com: drives a headless
//! Chrome session through the login flow, then works through the account's
//! remaining ad tasks (watch video, submit answer), reporting progress via
//! an in-memory log buffer exposed over HTTP.

pub mod bot;
pub mod browser;
pub mod runlog;
pub mod web;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use runlog::RunLog;

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Explicit Chrome/Chromium path; auto-detected when unset
    #[serde(default)]
    pub chrome_path: Option<String>,

    /// Run the browser headless
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Page operation timeout in seconds
    #[serde(default = "default_nav_timeout")]
    pub nav_timeout_secs: u64,

    /// Directory for the fixed-name screenshot artifacts
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: String,

    /// Total video-watch attempts per task
    #[serde(default = "default_video_attempts")]
    pub video_watch_attempts: u32,
}

fn default_headless() -> bool { true }
fn default_nav_timeout() -> u64 { 60 }
fn default_screenshot_dir() -> String { "screenshots".to_string() }
fn default_video_attempts() -> u32 { 3 }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: default_headless(),
            nav_timeout_secs: default_nav_timeout(),
            screenshot_dir: default_screenshot_dir(),
            video_watch_attempts: default_video_attempts(),
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("dteworks-bot").join("logs"))
}

impl AppConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dteworks-bot").join("config.json"))
    }

    /// Load config from file
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }
}

/// Application state shared between the web server and the automation driver
pub struct AppState {
    /// Application configuration
    pub config: Arc<RwLock<AppConfig>>,
    /// Run log exposed via /logs
    pub run_log: Arc<RunLog>,
    /// Running flag; doubles as the cooperative cancellation token the task
    /// loop polls at each iteration boundary
    pub is_running: Arc<AtomicBool>,
    /// Handle of the in-flight run task (for supervision)
    pub run_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AppState {
    /// Create new application state with loaded config
    pub fn new() -> Self {
        Self::with_config(AppConfig::load())
    }

    /// Create application state around an explicit config
    pub fn with_config(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            run_log: Arc::new(RunLog::new()),
            is_running: Arc::new(AtomicBool::new(false)),
            run_handle: tokio::sync::Mutex::new(None),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize logging (console + daily rolling file)
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "dteworks-bot.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
