//! Browser automation module
//!
//! Handles launching and controlling the single headless Chrome instance
//! used by an automation run, plus the DTEWorks-specific page flows.

mod session;
mod actions;
mod errors;

pub use session::{BrowserSession, BrowserSessionConfig, PageSession};
pub use actions::{DteActions, TaskReport, parse_remaining_count};
pub use errors::BrowserError;
