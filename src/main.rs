//! DTEWorks Bot - control server
//!
//! Runs the automation bot behind a small HTTP control surface.
//!
//! Environment variables:
//! - `PORT` - Server port (default: 3000)

use std::sync::Arc;

use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = dteworks_bot::init_logging();

    info!("Starting DTEWorks Bot");

    if let Some(dir) = dteworks_bot::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let state = Arc::new(dteworks_bot::AppState::new());

    // No display means Chrome must run headless
    {
        let mut config = state.config.write().await;
        let has_display = std::env::var("DISPLAY").map(|d| !d.is_empty()).unwrap_or(false);
        if !has_display && !config.headless {
            info!("No DISPLAY available - forcing headless=true");
            config.headless = true;
            config.save();
        }
    }

    info!("Dashboard: http://0.0.0.0:{}", port);

    // Start the web server (blocks until shutdown)
    dteworks_bot::web::start_server(state, port).await?;

    Ok(())
}
