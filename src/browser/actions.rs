//! DTEWorks page flows.
//!
//! Site-specific automation against dteworks.com (a Vant-based mobile web
//! app): log in with phone number + password, open the tasks tab, read the
//! remaining-task counter, and process one ad task (watch the video, submit
//! the answer). Selectors and text labels mirror the live site's markup and
//! are the brittle part of this crate; a layout change there surfaces only
//! as a logged run error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{BrowserError, PageSession};
use crate::runlog::RunLog;

/// Login page of the DTEWorks web app
pub const LOGIN_URL: &str = "https://dteworks.com/xml/index.html#/login";

/// Fixed delay between UI steps
const STEP_DELAY: Duration = Duration::from_secs(1);
/// Fixed delay between video-watch attempts
const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Fixed delay after submitting the login form
const LOGIN_SETTLE: Duration = Duration::from_secs(2);
/// How long to wait for the post-login route change
const NAV_SETTLE_SECS: u64 = 10;

/// DTEWorks selectors
mod selectors {
    pub const PHONE_INPUT: &str = r#"input[type="tel"][placeholder="Please enter your phone number"]"#;
    pub const PASSWORD_INPUT: &str = r#"input[type="password"][placeholder="Please enter login password"]"#;
    pub const LOGIN_BUTTON: &str = "button.van-button--danger";
    pub const ANSWER_INPUT: &str = ".answer-input input, input[placeholder*='answer']";
    pub const SUBMIT_BUTTON: &str = "button.van-button--primary";
}

/// Label on the tasks tab, matched by visible text
const TASKS_TAB_LABEL: &str = "Task";

static REMAINING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)remaining\s+tasks?\s*[:：]?\s*(\d+)").unwrap());

/// Extract the remaining-task count from page text.
///
/// Returns 0 when the label is absent — deliberately indistinguishable from
/// a legitimately empty task list; the caller marks the missing-label case
/// in the run log.
pub fn parse_remaining_count(body_text: &str) -> Option<u32> {
    REMAINING_RE
        .captures(body_text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Outcome of a single task, reported back to the driver loop. A failed
/// task never produces a report; it surfaces as an error instead.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub message: String,
    /// Remaining count re-read after submission; the driver loop uses this,
    /// not the handler itself.
    pub remaining: u32,
}

/// Page flows for one automation run.
pub struct DteActions<S: PageSession> {
    session: Arc<S>,
    log: Arc<RunLog>,
    /// Directory for the fixed-name screenshot artifacts
    screenshot_dir: PathBuf,
    /// Total video-watch attempts per task
    video_attempts: u32,
}

impl<S: PageSession> DteActions<S> {
    pub fn new(
        session: Arc<S>,
        log: Arc<RunLog>,
        screenshot_dir: PathBuf,
        video_attempts: u32,
    ) -> Self {
        Self {
            session,
            log,
            screenshot_dir,
            video_attempts: video_attempts.max(1),
        }
    }

    fn shot_path(&self, name: &str) -> PathBuf {
        self.screenshot_dir.join(name)
    }

    /// Log in with phone number and password.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), BrowserError> {
        self.log.push("Starting login process");

        self.session.navigate(LOGIN_URL).await?;
        self.log.push("Navigated to DTEWorks");

        self.session.fill(selectors::PHONE_INPUT, username).await?;
        self.session.fill(selectors::PASSWORD_INPUT, password).await?;

        self.session.click(selectors::LOGIN_BUTTON).await?;
        self.log.push("Login submitted");

        // The app routes client-side after login; treat a quiet page as
        // settled rather than failing the run.
        if let Err(e) = self.session.wait_for_navigation(NAV_SETTLE_SECS).await {
            debug!("No navigation observed after login submit: {}", e);
        }

        tokio::time::sleep(LOGIN_SETTLE).await;
        self.session.screenshot(&self.shot_path("afterLogin.png")).await?;

        Ok(())
    }

    /// Switch to the tasks view by clicking the tab with the matching
    /// visible text.
    pub async fn open_tasks_tab(&self) -> Result<(), BrowserError> {
        let script = format!(
            r#"
            (function() {{
                const candidates = Array.from(
                    document.querySelectorAll('.van-tabbar-item, .van-tab, [role="tab"]'));
                const tab = candidates.find(el => (el.textContent || '').includes('{label}'));
                if (!tab) return false;
                tab.click();
                return true;
            }})()
            "#,
            label = TASKS_TAB_LABEL
        );

        let clicked = self.session.execute_js(&script).await?;
        if !clicked.as_bool().unwrap_or(false) {
            return Err(BrowserError::ElementNotFound(format!(
                "tasks tab with label '{}'",
                TASKS_TAB_LABEL
            )));
        }

        self.log.push("Opened tasks tab");
        tokio::time::sleep(STEP_DELAY).await;
        self.session.screenshot(&self.shot_path("tasksTab.png")).await?;

        Ok(())
    }

    /// Read the remaining-task count from the page text.
    ///
    /// A missing label and a parse failure both yield 0, same as an empty
    /// task list; the run log gets a marker entry so operators can tell the
    /// cases apart.
    pub async fn remaining_tasks(&self) -> u32 {
        let body = match self.session.body_text().await {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to read page text for task count: {}", e);
                self.log.push(format!("Could not read task count ({}); treating as 0", e));
                return 0;
            }
        };

        match parse_remaining_count(&body) {
            Some(count) => count,
            None => {
                debug!("Remaining-tasks label not found in page text");
                self.log.push("Remaining tasks label not found; treating as 0");
                0
            }
        }
    }

    /// Process exactly one task: open it, watch the ad video, submit the
    /// answer, and re-read the remaining count.
    pub async fn process_task(&self) -> Result<TaskReport, BrowserError> {
        if !self.session.is_alive() {
            return Err(BrowserError::ConnectionLost("browser disconnected".into()));
        }

        // 1. Click the first item in the task list
        let clicked = self
            .session
            .execute_js(
                r#"
                (function() {
                    const item = document.querySelector(
                        '.task-list .van-cell, .van-list .van-cell, .van-cell');
                    if (!item) return false;
                    item.click();
                    return true;
                })()
                "#,
            )
            .await?;
        if !clicked.as_bool().unwrap_or(false) {
            return Err(BrowserError::ElementNotFound("task list item".into()));
        }

        // 2. Wait for the detail view
        tokio::time::sleep(STEP_DELAY).await;
        self.session.screenshot(&self.shot_path("taskDetail.png")).await?;

        // 3. Extract the advertisement text (best-effort)
        let ad_text = self
            .session
            .execute_js(
                r#"
                (function() {
                    const el = document.querySelector(
                        '.ad-content, .task-detail .ad-text, .van-notice-bar__content');
                    return el ? (el.textContent || '').trim() : '';
                })()
                "#,
            )
            .await
            .map(|v| v.as_str().unwrap_or_default().to_string())
            .unwrap_or_default();

        if ad_text.is_empty() {
            self.log.push("Ad text not found on task detail page");
        } else {
            self.log.push(format!("Extracted ad text: {}", ad_text));
        }

        // 4. Watch the ad video, with bounded retries
        self.watch_video().await?;

        // 5. Submit the answer derived from the ad text
        self.submit_answer(&ad_text).await?;

        // 6. Settle, screenshot, re-read the count
        tokio::time::sleep(STEP_DELAY).await;
        self.session.screenshot(&self.shot_path("afterSubmit.png")).await?;

        let remaining = self.remaining_tasks().await;

        Ok(TaskReport {
            message: format!("Task completed; {} task(s) remaining", remaining),
            remaining,
        })
    }

    /// Video-watch sub-loop: start playback, wait for the video element to
    /// report a non-paused state, then watch until it ends. Up to
    /// `video_attempts` attempts total; exhaustion aborts the task.
    async fn watch_video(&self) -> Result<(), BrowserError> {
        for attempt in 1..=self.video_attempts {
            self.log.push(format!(
                "Watching ad video (attempt {}/{})",
                attempt, self.video_attempts
            ));

            match self.watch_video_once().await {
                Ok(()) => {
                    self.log.push("Ad video watched");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Video watch attempt {} failed: {}", attempt, e);
                    self.log.push(format!("Video watch attempt {} failed: {}", attempt, e));
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }

        Err(BrowserError::Timeout(format!(
            "video watch failed after {} attempts",
            self.video_attempts
        )))
    }

    /// One playback attempt: play, confirm non-paused, wait for the end.
    async fn watch_video_once(&self) -> Result<(), BrowserError> {
        let started = self
            .session
            .execute_js(
                r#"
                (function() {
                    const video = document.querySelector('video');
                    if (!video) return false;
                    video.muted = true;
                    video.play().catch(() => {});
                    return true;
                })()
                "#,
            )
            .await?;
        if !started.as_bool().unwrap_or(false) {
            return Err(BrowserError::ElementNotFound("video element".into()));
        }

        // Wait for playback to actually start
        let mut playing = false;
        for _ in 0..20 {
            let state = self
                .session
                .execute_js(
                    r#"
                    (function() {
                        const video = document.querySelector('video');
                        return video ? !video.paused : false;
                    })()
                    "#,
                )
                .await?;
            if state.as_bool().unwrap_or(false) {
                playing = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        if !playing {
            return Err(BrowserError::Timeout("video never started playing".into()));
        }

        info!("Session {} video playback started", self.session.id());

        // Watch until the video reports completion (bounded at 2 minutes)
        for _ in 0..120 {
            let done = self
                .session
                .execute_js(
                    r#"
                    (function() {
                        const video = document.querySelector('video');
                        if (!video) return true;
                        if (video.ended) return true;
                        return video.duration > 0 &&
                               video.currentTime >= video.duration - 0.25;
                    })()
                    "#,
                )
                .await?;
            if done.as_bool().unwrap_or(false) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Err(BrowserError::Timeout("video did not finish within 2 minutes".into()))
    }

    /// Fill the answer field with the ad text and submit.
    async fn submit_answer(&self, ad_text: &str) -> Result<(), BrowserError> {
        self.session.fill(selectors::ANSWER_INPUT, ad_text).await?;
        self.session.click(selectors::SUBMIT_BUTTON).await?;
        self.log.push("Answer submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remaining_count_present() {
        assert_eq!(parse_remaining_count("Remaining tasks: 7"), Some(7));
        assert_eq!(parse_remaining_count("remaining task: 1"), Some(1));
        assert_eq!(parse_remaining_count("REMAINING TASKS 12"), Some(12));
    }

    #[test]
    fn test_parse_remaining_count_embedded_in_page_text() {
        let body = "Home\nProfile\nTask hall\nRemaining tasks: 42\nEarnings today: 3.50";
        assert_eq!(parse_remaining_count(body), Some(42));
    }

    #[test]
    fn test_parse_remaining_count_fullwidth_colon() {
        assert_eq!(parse_remaining_count("Remaining tasks：3"), Some(3));
    }

    #[test]
    fn test_parse_remaining_count_absent() {
        assert_eq!(parse_remaining_count(""), None);
        assert_eq!(parse_remaining_count("Welcome back"), None);
        assert_eq!(parse_remaining_count("Remaining tasks: many"), None);
    }

    #[test]
    fn test_parse_remaining_count_zero() {
        assert_eq!(parse_remaining_count("Remaining tasks: 0"), Some(0));
    }
}
