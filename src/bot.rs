//! Core bot logic: run control shared with the web routes, plus the
//! automation driver itself.
//!
//! A run is one end-to-end session: launch Chrome, log in to DTEWorks,
//! process ad tasks until none remain or a step fails. The HTTP caller only
//! gets the initial acknowledgement; everything after that is observable
//! through the run log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::browser::{BrowserError, BrowserSession, BrowserSessionConfig, DteActions, PageSession};
use crate::runlog::RunLog;
use crate::{AppConfig, AppState};

// ========== Shared Response Types ==========

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotStatus {
    pub is_running: bool,
    pub log_count: usize,
}

// ========== Run-level Errors ==========

/// Run-level failures, tagged with the step that produced them. These never
/// reach the HTTP caller directly; they land in the run log as
/// `Error: <step>: <cause>` lines.
#[derive(thiserror::Error, Debug)]
pub enum BotError {
    #[error("browser launch failed: {0}")]
    Launch(#[source] BrowserError),

    #[error("login failed: {0}")]
    Login(#[source] BrowserError),

    #[error("tasks view unavailable: {0}")]
    TasksView(#[source] BrowserError),

    #[error("task failed: {0}")]
    Task(#[source] BrowserError),
}

// ========== Run Control Logic ==========

/// Start an automation run - shared logic for the `/start` route.
///
/// Validates credentials, rejects a second concurrent run, resets the run
/// log, and spawns the driver in the background. Returns as soon as the run
/// is launched; completion and failure are reported via the run log only.
pub async fn start_automation_logic(
    state: &AppState,
    username: &str,
    password: &str,
) -> Result<(), String> {
    if username.trim().is_empty() || password.trim().is_empty() {
        return Err("Username and password required".into());
    }

    // Claim the running flag atomically so two concurrent /start requests
    // cannot both launch a browser.
    if state
        .is_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err("Automation already running".into());
    }

    let config = state.config.read().await.clone();

    state.run_log.clear();
    state.run_log.push("Automation started");

    let handle = spawn_run_task_safe(
        state.run_log.clone(),
        state.is_running.clone(),
        config,
        username.to_string(),
        password.to_string(),
    );

    {
        let mut slot = state.run_handle.lock().await;
        if let Some(old) = slot.replace(handle) {
            // Previous run already cleared the flag; its task is finished or
            // finishing. Never abort it mid-cleanup.
            if !old.is_finished() {
                warn!("Previous run task still winding down");
            }
        }
    }

    info!("Automation run launched");
    Ok(())
}

/// Stop the current run - shared logic for the `/stop` route.
///
/// Only flips the cooperative cancellation flag; an in-flight page operation
/// finishes before the driver loop notices at its next iteration boundary.
pub fn stop_automation_logic(state: &AppState) {
    info!("Stop command received");
    state.is_running.store(false, Ordering::SeqCst);
    state.run_log.push("Stop command received");
}

/// Get run status - shared logic.
pub fn get_status_logic(state: &AppState) -> BotStatus {
    BotStatus {
        is_running: state.is_running.load(Ordering::SeqCst),
        log_count: state.run_log.len(),
    }
}

// ========== Automation Driver ==========

/// Spawn the run task with panic safety.
///
/// If the driver panics, the panic is logged and the running flag is cleared
/// so the server can accept the next `/start`.
fn spawn_run_task_safe(
    log: Arc<RunLog>,
    is_running: Arc<AtomicBool>,
    config: AppConfig,
    username: String,
    password: String,
) -> tokio::task::JoinHandle<()> {
    let log_cleanup = log.clone();
    let running_cleanup = is_running.clone();

    tokio::spawn(async move {
        let run = std::panic::AssertUnwindSafe(run_automation(
            log, is_running, config, username, password,
        ));

        use futures::FutureExt;
        if let Err(panic_info) = run.catch_unwind().await {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };

            error!("[PanicSafety] Run task panicked: {}", panic_msg);
            log_cleanup.push(format!("Error: run panicked: {}", panic_msg));
            running_cleanup.store(false, Ordering::SeqCst);
        }
    })
}

/// Drive one end-to-end automation run.
///
/// Whatever happens inside the run - success, step failure, stop request -
/// the browser is closed and the running flag cleared exactly once before
/// this returns.
async fn run_automation(
    log: Arc<RunLog>,
    is_running: Arc<AtomicBool>,
    config: AppConfig,
    username: String,
    password: String,
) {
    let session_config = BrowserSessionConfig::for_run(
        &chrono::Utc::now().timestamp_millis().to_string(),
    )
    .headless(config.headless)
    .chrome_path(config.chrome_path.clone())
    .timeout(config.nav_timeout_secs);

    let session = match BrowserSession::new(session_config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            let err = BotError::Launch(e);
            error!("{}", err);
            log.push(format!("Error: {}", err));
            is_running.store(false, Ordering::SeqCst);
            return;
        }
    };

    run_with_session(log, is_running, &config, session, &username, &password).await;
}

/// Run the driver against an already-launched session.
///
/// Success, step failure, and stop all funnel through the same tail: the
/// session is closed and the running flag cleared exactly once.
async fn run_with_session<S: PageSession>(
    log: Arc<RunLog>,
    is_running: Arc<AtomicBool>,
    config: &AppConfig,
    session: Arc<S>,
    username: &str,
    password: &str,
) {
    let actions = DteActions::new(
        session.clone(),
        log.clone(),
        config.screenshot_dir.clone().into(),
        config.video_watch_attempts,
    );

    match drive(&actions, &log, &is_running, username, password).await {
        Ok(()) => info!("Automation run finished cleanly"),
        Err(e) => {
            error!("Automation run failed: {}", e);
            log.push(format!("Error: {}", e));
        }
    }

    // Cleanup path: runs for success, failure, and stop alike.
    if let Err(e) = session.close().await {
        warn!("Failed to close browser session: {}", e);
    }
    is_running.store(false, Ordering::SeqCst);
    log.push("Automation run ended");
}

/// The run body: login, tasks tab, then the task loop.
async fn drive<S: PageSession>(
    actions: &DteActions<S>,
    log: &RunLog,
    is_running: &AtomicBool,
    username: &str,
    password: &str,
) -> Result<(), BotError> {
    actions.login(username, password).await.map_err(BotError::Login)?;
    actions.open_tasks_tab().await.map_err(BotError::TasksView)?;

    let mut remaining = actions.remaining_tasks().await;
    log.push(format!("Remaining tasks: {}", remaining));

    while remaining > 0 {
        // Cancellation is checked at every iteration boundary; /stop cannot
        // interrupt the step in flight.
        if !is_running.load(Ordering::SeqCst) {
            log.push("Stop requested; ending run");
            return Ok(());
        }

        let report = actions.process_task().await.map_err(BotError::Task)?;
        log.push(report.message.clone());
        remaining = report.remaining;
    }

    log.push("All tasks completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        let state = AppState::with_config(AppConfig {
            // Force a fast, deterministic launch failure; these tests only
            // exercise the control logic, never a real browser.
            chrome_path: Some("/nonexistent/chrome-for-tests".into()),
            ..AppConfig::default()
        });
        state
    }

    #[tokio::test]
    async fn test_start_requires_username_and_password() {
        let state = test_state();

        for (user, pass) in [("", ""), ("x", ""), ("", "y"), ("  ", "y")] {
            let result = start_automation_logic(&state, user, pass).await;
            assert_eq!(result, Err("Username and password required".to_string()));
        }

        // Rejection happens before the buffer is touched or a browser spawned
        assert!(!state.is_running.load(Ordering::SeqCst));
        assert!(state.run_log.is_empty());
    }

    #[tokio::test]
    async fn test_start_rejected_while_running() {
        let state = test_state();
        state.is_running.store(true, Ordering::SeqCst);
        state.run_log.push("existing entry");

        let result = start_automation_logic(&state, "user", "pass").await;
        assert_eq!(result, Err("Automation already running".to_string()));

        // The log buffer is not reset by a rejected start
        let entries = state.run_log.snapshot();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with("existing entry"));
    }

    #[tokio::test]
    async fn test_start_resets_log_and_acknowledges() {
        let state = test_state();
        state.run_log.push("stale entry from previous run");

        let result = start_automation_logic(&state, "user", "pass").await;
        assert_eq!(result, Ok(()));

        let entries = state.run_log.snapshot();
        assert!(entries[0].ends_with("Automation started"));
        assert!(!entries.iter().any(|e| e.contains("stale entry")));

        // Let the doomed background run finish its cleanup path
        let handle = state.run_handle.lock().await.take();
        if let Some(h) = handle {
            let _ = h.await;
        }
        assert!(!state.is_running.load(Ordering::SeqCst));
        assert!(state
            .run_log
            .snapshot()
            .iter()
            .any(|e| e.contains("Error: browser launch failed")));
    }

    #[tokio::test]
    async fn test_stop_clears_flag_and_logs_once() {
        let state = test_state();
        state.is_running.store(true, Ordering::SeqCst);
        let before = state.run_log.len();

        stop_automation_logic(&state);

        assert!(!state.is_running.load(Ordering::SeqCst));
        let entries = state.run_log.snapshot();
        assert_eq!(entries.len(), before + 1);
        assert!(entries.last().unwrap().ends_with("Stop command received"));
    }

    #[tokio::test]
    async fn test_status_reflects_flag_and_log() {
        let state = test_state();
        state.run_log.push("one");

        let status = get_status_logic(&state);
        assert!(!status.is_running);
        assert_eq!(status.log_count, 1);
    }

    // ---- Driver cleanup, against an in-memory session ----

    use async_trait::async_trait;
    use std::path::Path;

    /// In-memory stand-in for a live browser session. Page flows are
    /// answered from a scripted remaining-task counter, with switchable
    /// failure points for the steps the driver must survive.
    struct FakeSession {
        alive: AtomicBool,
        close_called: AtomicBool,
        fail_login_fill: bool,
        fail_tasks_tab: bool,
        fail_task_item: bool,
        remaining: parking_lot::Mutex<u32>,
    }

    impl FakeSession {
        fn new(remaining: u32) -> Self {
            Self {
                alive: AtomicBool::new(true),
                close_called: AtomicBool::new(false),
                fail_login_fill: false,
                fail_tasks_tab: false,
                fail_task_item: false,
                remaining: parking_lot::Mutex::new(remaining),
            }
        }
    }

    #[async_trait]
    impl PageSession for FakeSession {
        fn id(&self) -> &str {
            "Run-test"
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn navigate(&self, _url: &str) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn wait_for_navigation(&self, _timeout_secs: u64) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn execute_js(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
            if script.contains("van-tabbar-item") {
                return Ok(serde_json::json!(!self.fail_tasks_tab));
            }
            if script.contains("van-cell") {
                return Ok(serde_json::json!(!self.fail_task_item));
            }
            if script.contains("ad-content") {
                return Ok(serde_json::json!("Sample advertisement"));
            }
            // Video state probes: playback starts and finishes immediately
            Ok(serde_json::json!(true))
        }

        async fn body_text(&self) -> Result<String, BrowserError> {
            Ok(format!("Remaining tasks: {}", *self.remaining.lock()))
        }

        async fn click(&self, selector: &str) -> Result<(), BrowserError> {
            if selector.contains("van-button--primary") {
                let mut remaining = self.remaining.lock();
                *remaining = remaining.saturating_sub(1);
            }
            Ok(())
        }

        async fn fill(&self, selector: &str, _text: &str) -> Result<(), BrowserError> {
            if self.fail_login_fill && selector.contains("tel") {
                return Err(BrowserError::ElementNotFound(selector.to_string()));
            }
            Ok(())
        }

        async fn screenshot(&self, _path: &Path) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), BrowserError> {
            self.close_called.store(true, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn run_config() -> AppConfig {
        AppConfig {
            screenshot_dir: std::env::temp_dir()
                .join("dteworks-bot-tests")
                .to_string_lossy()
                .into_owned(),
            ..AppConfig::default()
        }
    }

    async fn run_fake(session: FakeSession, running: bool) -> (Arc<RunLog>, Arc<FakeSession>) {
        let log = Arc::new(RunLog::new());
        let is_running = Arc::new(AtomicBool::new(running));
        let session = Arc::new(session);

        run_with_session(
            log.clone(),
            is_running.clone(),
            &run_config(),
            session.clone(),
            "user",
            "pass",
        )
        .await;

        assert!(
            !is_running.load(Ordering::SeqCst),
            "running flag must be cleared after every run"
        );
        (log, session)
    }

    fn log_contains(log: &RunLog, needle: &str) -> bool {
        log.snapshot().iter().any(|e| e.contains(needle))
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_all_tasks_and_closes_session() {
        let (log, session) = run_fake(FakeSession::new(2), true).await;

        assert!(session.close_called.load(Ordering::SeqCst));
        assert!(log_contains(&log, "All tasks completed"));
        assert!(log_contains(&log, "Automation run ended"));
        assert_eq!(*session.remaining.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_failure_still_closes_session() {
        let mut session = FakeSession::new(1);
        session.fail_login_fill = true;

        let (log, session) = run_fake(session, true).await;

        assert!(session.close_called.load(Ordering::SeqCst));
        assert!(log_contains(&log, "Error: login failed"));
        assert!(log_contains(&log, "Automation run ended"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_tasks_tab_still_closes_session() {
        let mut session = FakeSession::new(1);
        session.fail_tasks_tab = true;

        let (log, session) = run_fake(session, true).await;

        assert!(session.close_called.load(Ordering::SeqCst));
        assert!(log_contains(&log, "Error: tasks view unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_failure_still_closes_session() {
        let mut session = FakeSession::new(1);
        session.fail_task_item = true;

        let (log, session) = run_fake(session, true).await;

        assert!(session.close_called.load(Ordering::SeqCst));
        assert!(log_contains(&log, "Error: task failed"));
        assert!(log_contains(&log, "Automation run ended"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_browser_aborts_task_loop() {
        let session = FakeSession::new(1);
        session.alive.store(false, Ordering::SeqCst);

        let (log, session) = run_fake(session, true).await;

        assert!(session.close_called.load(Ordering::SeqCst));
        assert!(log_contains(&log, "Error: task failed"));
        assert!(log_contains(&log, "Connection lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_is_honored_before_next_task() {
        // Flag already cleared when the loop first checks it
        let (log, session) = run_fake(FakeSession::new(3), false).await;

        assert!(session.close_called.load(Ordering::SeqCst));
        assert!(log_contains(&log, "Stop requested; ending run"));
        assert!(!log_contains(&log, "All tasks completed"));
        assert_eq!(*session.remaining.lock(), 3);
    }
}
