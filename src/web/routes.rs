//! HTTP route handlers for the control server.
//!
//! Three control endpoints plus a status probe; the landing page is served
//! by the static fallback in `super`. All business logic is delegated to
//! `crate::bot`.

use std::sync::Arc;

use axum::{
    extract::{Extension, Json},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};

use crate::bot;
use crate::AppState;

/// JSON message response helper
fn msg_response(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "message": msg })))
}

/// Build the control router.
pub fn control_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/start", post(start_automation))
        .route("/stop", post(stop_automation))
        .route("/logs", get(get_logs))
        .route("/status", get(get_status))
        .layer(Extension(state))
}

#[derive(serde::Deserialize)]
struct StartRequest {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

async fn start_automation(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse {
    let username = req.username.unwrap_or_default();
    let password = req.password.unwrap_or_default();

    match bot::start_automation_logic(&state, &username, &password).await {
        Ok(()) => msg_response(StatusCode::OK, "Automation started").into_response(),
        Err(e) => msg_response(StatusCode::BAD_REQUEST, &e).into_response(),
    }
}

async fn stop_automation(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    bot::stop_automation_logic(&state);
    msg_response(StatusCode::OK, "Stopping automation")
}

async fn get_logs(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({ "logs": state.run_log.snapshot() }))
}

async fn get_status(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    Json(bot::get_status_logic(&state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    use crate::AppConfig;

    fn test_router() -> (Router, Arc<AppState>) {
        let state = Arc::new(AppState::with_config(AppConfig {
            chrome_path: Some("/nonexistent/chrome-for-tests".into()),
            ..AppConfig::default()
        }));
        (control_router(state.clone()), state)
    }

    fn json_post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_with_empty_body_is_rejected() {
        let (router, state) = test_router();

        let response = router.oneshot(json_post("/start", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!state.is_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_start_with_partial_credentials_is_rejected() {
        let (router, _state) = test_router();

        let response = router
            .oneshot(json_post("/start", r#"{"username":"x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_with_valid_credentials_acknowledges() {
        let (router, state) = test_router();

        let response = router
            .oneshot(json_post("/start", r#"{"username":"x","password":"y"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state
            .run_log
            .snapshot()
            .first()
            .map(|e| e.ends_with("Automation started"))
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let (router, state) = test_router();
        state.is_running.store(true, Ordering::SeqCst);

        let response = router
            .oneshot(json_post("/start", r#"{"username":"x","password":"y"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stop_always_succeeds_and_logs() {
        let (router, state) = test_router();

        let response = router
            .oneshot(json_post("/stop", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.run_log.len(), 1);
    }

    #[tokio::test]
    async fn test_logs_and_status_endpoints() {
        let (router, state) = test_router();
        state.run_log.push("hello");

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/logs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
