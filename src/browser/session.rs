//! Browser session management
//!
//! Handles launching and controlling the single headless Chrome instance
//! owned by one automation run. The session wraps exactly one page; it is
//! created when a run starts and torn down when the run ends, whatever the
//! outcome.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::BrowserError;

/// Global counter for sequential run naming (Run-1, Run-2, ...)
static RUN_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Find Chrome/Chromium executable on the system
fn find_chrome() -> Option<std::path::PathBuf> {
    let candidates: Vec<std::path::PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            std::path::PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            std::path::PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(std::path::PathBuf::from(format!(r"{}\Google\Chrome\Application\chrome.exe", local)));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![
            std::path::PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            std::path::PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    } else {
        vec![
            std::path::PathBuf::from("/usr/bin/google-chrome"),
            std::path::PathBuf::from("/usr/bin/google-chrome-stable"),
            std::path::PathBuf::from("/usr/bin/chromium"),
            std::path::PathBuf::from("/usr/bin/chromium-browser"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// Configuration for a browser session
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSessionConfig {
    /// Path to Chrome/Chromium executable
    pub chrome_path: Option<String>,
    /// Run in headless mode
    pub headless: bool,
    /// User data directory
    pub user_data_dir: Option<String>,
    /// Page operation timeout in seconds
    pub timeout_secs: u64,
    /// Window width
    pub window_width: u32,
    /// Window height
    pub window_height: u32,
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            user_data_dir: None,
            timeout_secs: 60,
            window_width: 1280,
            window_height: 800,
        }
    }
}

impl BrowserSessionConfig {
    /// Create config with a run-scoped browser data directory under the
    /// system temp dir.
    pub fn for_run(run_id: &str) -> Self {
        let user_data_dir = std::env::temp_dir()
            .join("dteworks-bot")
            .join("browser_data")
            .join(run_id)
            .to_string_lossy()
            .to_string();

        Self {
            user_data_dir: Some(user_data_dir),
            ..Default::default()
        }
    }

    /// Set headless mode
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Set Chrome path
    pub fn chrome_path(mut self, path: Option<String>) -> Self {
        self.chrome_path = path;
        self
    }

    /// Set timeout
    pub fn timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// A browser session for one automation run: one Chrome instance, one page.
pub struct BrowserSession {
    /// Display name, e.g. "Run-1"
    pub id: String,
    /// The browser instance
    browser: Arc<RwLock<Option<Browser>>>,
    /// The single active page
    page: Arc<RwLock<Option<Page>>>,
    /// Session configuration
    config: BrowserSessionConfig,
    /// Whether Chrome is still connected
    alive: Arc<AtomicBool>,
}

impl BrowserSession {
    /// Launch Chrome and take ownership of its initial page.
    pub async fn new(config: BrowserSessionConfig) -> Result<Self, BrowserError> {
        let session_id = format!("Run-{}", RUN_COUNTER.fetch_add(1, Ordering::Relaxed));

        info!("Launching browser session {} (headless: {})", session_id, config.headless);

        if config.chrome_path.is_none() && find_chrome().is_none() {
            return Err(BrowserError::LaunchFailed(
                "Chrome/Chromium not found. Install Chrome and restart the server.".to_string(),
            ));
        }

        let mut builder = BrowserConfig::builder();

        if config.headless {
            builder = builder.new_headless_mode();
        } else {
            builder = builder.with_head();
        }

        if let Some(ref path) = config.chrome_path {
            builder = builder.chrome_executable(path);
        } else if let Some(chrome_path) = find_chrome() {
            debug!("Auto-detected Chrome at: {}", chrome_path.display());
            builder = builder.chrome_executable(chrome_path);
        }

        if let Some(ref dir) = config.user_data_dir {
            let _ = std::fs::create_dir_all(dir);
            builder = builder.user_data_dir(dir);
        }

        // Keys must NOT include the "--" prefix; chromiumoxide adds it.
        builder = builder
            .no_sandbox()
            .arg("disable-gpu")
            .arg("disable-dev-shm-usage")
            .arg("mute-audio")
            .arg("no-first-run")
            .arg("no-default-browser-check")
            .arg("disable-notifications")
            .arg("disable-translate")
            .arg(("autoplay-policy", "no-user-gesture-required"))
            .window_size(config.window_width, config.window_height);

        let browser_config = builder
            .build()
            .map_err(BrowserError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // Drive CDP events in the background; when the handler stream ends,
        // Chrome has disconnected or crashed.
        let session_id_clone = session_id.clone();
        let alive_flag = Arc::new(AtomicBool::new(true));
        let alive_for_handler = alive_flag.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                debug!("Session {} browser event: {:?}", session_id_clone, event);
            }
            warn!("Session {} Chrome disconnected (event handler ended)", session_id_clone);
            alive_for_handler.store(false, Ordering::Relaxed);
        });

        // Chrome opens with a blank tab; take it as our page and close extras.
        let page = {
            let mut pages = browser
                .pages()
                .await
                .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

            let main_page = if !pages.is_empty() {
                pages.remove(0)
            } else {
                browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?
            };

            for extra_page in pages {
                debug!("Closing extra blank tab");
                let _ = extra_page.close().await;
            }

            main_page
        };

        info!("Browser session {} created", session_id);

        Ok(Self {
            id: session_id,
            browser: Arc::new(RwLock::new(Some(browser))),
            page: Arc::new(RwLock::new(Some(page))),
            config,
            alive: alive_flag,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check if Chrome is still connected
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Navigate to a URL
    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let page = self.page.read().await;
        let page = page.as_ref().ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        debug!("Session {} navigating to: {}", self.id, url);
        page.goto(url)
            .await
            .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;

        Ok(())
    }

    /// Wait for the current navigation to settle, with a timeout.
    pub async fn wait_for_navigation(&self, timeout_secs: u64) -> Result<(), BrowserError> {
        let page = self.page.read().await;
        let page = page.as_ref().ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        tokio::time::timeout(Duration::from_secs(timeout_secs), page.wait_for_navigation())
            .await
            .map_err(|_| BrowserError::Timeout("Navigation timeout".into()))?
            .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;

        Ok(())
    }

    /// Execute JavaScript on the page with the session's default timeout.
    pub async fn execute_js(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        self.execute_js_with_timeout(script, self.config.timeout_secs).await
    }

    /// Execute JavaScript on the page with a custom timeout (in seconds).
    pub async fn execute_js_with_timeout(
        &self,
        script: &str,
        timeout_secs: u64,
    ) -> Result<serde_json::Value, BrowserError> {
        let page = self.page.read().await;
        let page = page.as_ref().ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), page.evaluate(script))
            .await
            .map_err(|_| BrowserError::Timeout(format!("JavaScript execution timed out after {}s", timeout_secs)))?
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;

        Ok(result.into_value::<serde_json::Value>().unwrap_or(serde_json::Value::Null))
    }

    /// Full visible text of the page body.
    pub async fn body_text(&self) -> Result<String, BrowserError> {
        let value = self
            .execute_js("document.body ? document.body.innerText : ''")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Click on an element by selector
    pub async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let page = self.page.read().await;
        let page = page.as_ref().ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        let element = page
            .find_element(selector)
            .await
            .map_err(|e| BrowserError::ElementNotFound(format!("{}: {}", selector, e)))?;

        element
            .click()
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;

        Ok(())
    }

    /// Fill a form field: click it, then type the text.
    pub async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let page = self.page.read().await;
        let page = page.as_ref().ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        let element = page
            .find_element(selector)
            .await
            .map_err(|e| BrowserError::ElementNotFound(format!("{}: {}", selector, e)))?;

        element.click().await.ok();

        // Brief human-ish pause before typing into the focused field
        let delay = rand::thread_rng().gen_range(200..500);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        element
            .type_str(text)
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;

        Ok(())
    }

    /// Capture a full-page screenshot to the given path, creating parent
    /// directories as needed. Overwrites any previous capture.
    pub async fn screenshot(&self, path: impl AsRef<Path>) -> Result<(), BrowserError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let page = self.page.read().await;
        let page = page.as_ref().ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();

        page.save_screenshot(params, path)
            .await
            .map_err(|e| BrowserError::ScreenshotFailed(e.to_string()))?;

        debug!("Session {} saved screenshot: {}", self.id, path.display());
        Ok(())
    }

    /// Close the browser session
    pub async fn close(&self) -> Result<(), BrowserError> {
        // Mark as not alive first to prevent new operations
        self.alive.store(false, Ordering::Relaxed);

        // Close the page first (stops navigation/JS execution)
        {
            let mut page = self.page.write().await;
            if let Some(p) = page.take() {
                let _ = p.close().await;
            }
        }

        // Graceful browser close, brief grace period, then force kill so no
        // orphaned Chrome processes survive the run.
        {
            let mut browser = self.browser.write().await;
            if let Some(mut b) = browser.take() {
                let _ = b.close().await;
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = b.kill().await;
            }
        }

        info!("Browser session {} closed", self.id);
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}

/// Page operations the automation flows depend on.
///
/// `BrowserSession` is the real implementation; tests drive the flows
/// against an in-memory fake so step failures can be injected without a
/// browser.
#[async_trait]
pub trait PageSession: Send + Sync {
    fn id(&self) -> &str;
    fn is_alive(&self) -> bool;
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn wait_for_navigation(&self, timeout_secs: u64) -> Result<(), BrowserError>;
    async fn execute_js(&self, script: &str) -> Result<serde_json::Value, BrowserError>;
    async fn body_text(&self) -> Result<String, BrowserError>;
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;
    async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError>;
    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError>;
    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
impl PageSession for BrowserSession {
    fn id(&self) -> &str {
        BrowserSession::id(self)
    }

    fn is_alive(&self) -> bool {
        BrowserSession::is_alive(self)
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        BrowserSession::navigate(self, url).await
    }

    async fn wait_for_navigation(&self, timeout_secs: u64) -> Result<(), BrowserError> {
        BrowserSession::wait_for_navigation(self, timeout_secs).await
    }

    async fn execute_js(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        BrowserSession::execute_js(self, script).await
    }

    async fn body_text(&self) -> Result<String, BrowserError> {
        BrowserSession::body_text(self).await
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        BrowserSession::click(self, selector).await
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        BrowserSession::fill(self, selector, text).await
    }

    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError> {
        BrowserSession::screenshot(self, path).await
    }

    async fn close(&self) -> Result<(), BrowserError> {
        BrowserSession::close(self).await
    }
}
