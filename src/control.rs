//! Loopback HTTP control plane the assistant-side hooks call into.
//!
//! Every handler hands the blocking core to `spawn_blocking`; the server
//! itself runs on a dedicated current-thread runtime beside the
//! reconciliation loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{RelayError, StoreError};
use crate::relay::Relay;

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub session_id: String,
    pub project_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub tool_name: String,
    pub command: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub response_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRequest {
    pub session_id: String,
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: String,
    pub thread_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub bot: String,
    pub active_sessions: usize,
    pub pending_approvals: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Ack {
    ok: bool,
}

#[derive(Debug)]
pub enum ControlError {
    BadRequest(String),
    Relay(RelayError),
    Worker(String),
}

impl ControlError {
    fn status(&self) -> StatusCode {
        match self {
            ControlError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ControlError::Relay(err) => match err {
                RelayError::SessionNotFound(_) | RelayError::Store(StoreError::NoActiveSession(_)) => {
                    StatusCode::NOT_FOUND
                }
                RelayError::SessionInactive { .. }
                | RelayError::Store(StoreError::AlreadyExists(_))
                | RelayError::Store(StoreError::ThreadActive(_)) => StatusCode::CONFLICT,
                RelayError::Gateway(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ControlError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ControlError::BadRequest(msg) | ControlError::Worker(msg) => msg.clone(),
            ControlError::Relay(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, error = %self.message(), "control request failed");
        } else {
            warn!(%status, error = %self.message(), "control request rejected");
        }
        (status, Json(ErrorBody { error: self.message() })).into_response()
    }
}

type ControlResult<T> = Result<Json<T>, ControlError>;

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/session/start", post(start_session))
        .route("/request_approval", post(request_approval))
        .route("/notification", post(notification))
        .route("/response", post(response))
        .route("/session/end", post(end_session))
        .with_state(relay)
}

/// Serves until `stop` is set, then drains in-flight requests.
pub async fn serve(
    listener: tokio::net::TcpListener,
    relay: Arc<Relay>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(relay))
        .with_graceful_shutdown(async move {
            while !stop.load(Ordering::Relaxed) {
                tokio::time::sleep(SHUTDOWN_POLL).await;
            }
        })
        .await
}

/// Runs the control plane on its own thread and current-thread runtime. The
/// listener is bound by the caller so bind failures surface at startup.
pub fn spawn(
    listener: std::net::TcpListener,
    relay: Arc<Relay>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    listener.set_nonblocking(true)?;
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("control-plane".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(err) => {
                        error!(error = %err, "control plane listener unusable");
                        stop.store(true, Ordering::Relaxed);
                        return;
                    }
                };
                if let Some(addr) = addr {
                    info!(%addr, "control plane listening");
                }
                if let Err(err) = serve(listener, relay, Arc::clone(&stop)).await {
                    error!(error = %err, "control plane exited");
                    stop.store(true, Ordering::Relaxed);
                }
            });
        })
}

async fn blocking<T, F>(relay: Arc<Relay>, work: F) -> Result<T, ControlError>
where
    T: Send + 'static,
    F: FnOnce(&Relay) -> Result<T, RelayError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || work(&relay))
        .await
        .map_err(|err| ControlError::Worker(format!("handler task failed: {}", err)))?
        .map_err(ControlError::Relay)
}

fn require(field: &'static str, value: &str) -> Result<(), ControlError> {
    if value.trim().is_empty() {
        return Err(ControlError::BadRequest(format!("{} is required", field)));
    }
    Ok(())
}

async fn health(State(relay): State<Arc<Relay>>) -> ControlResult<Health> {
    let health = blocking(relay, |relay| {
        Ok(Health {
            status: "ok".to_string(),
            bot: relay.identity().username.clone(),
            active_sessions: relay.store().list_active()?.len(),
            pending_approvals: relay.tracker().len(),
        })
    })
    .await?;
    Ok(Json(health))
}

async fn start_session(
    State(relay): State<Arc<Relay>>,
    Json(req): Json<StartRequest>,
) -> ControlResult<StartResponse> {
    require("session_id", &req.session_id)?;
    let session = blocking(relay, move |relay| {
        relay.start_session(&req.session_id, &req.project_path)
    })
    .await?;
    Ok(Json(StartResponse {
        session_id: session.id,
        thread_id: session.thread_id,
        status: session.status.to_string(),
    }))
}

async fn request_approval(
    State(relay): State<Arc<Relay>>,
    Json(req): Json<ApprovalRequest>,
) -> ControlResult<ApprovalResponse> {
    require("session_id", &req.session_id)?;
    require("tool_name", &req.tool_name)?;
    let response_file = blocking(relay, move |relay| {
        relay.request_tool_approval(&req.session_id, &req.tool_name, &req.command, &req.description)
    })
    .await?;
    Ok(Json(ApprovalResponse { response_file }))
}

async fn notification(
    State(relay): State<Arc<Relay>>,
    Json(req): Json<NotificationRequest>,
) -> ControlResult<Ack> {
    require("session_id", &req.session_id)?;
    blocking(relay, move |relay| relay.send_notification(&req.session_id, &req.message)).await?;
    Ok(Json(Ack { ok: true }))
}

async fn response(
    State(relay): State<Arc<Relay>>,
    Json(req): Json<ResponseRequest>,
) -> ControlResult<Ack> {
    require("session_id", &req.session_id)?;
    blocking(relay, move |relay| relay.send_response(&req.session_id, &req.response)).await?;
    Ok(Json(Ack { ok: true }))
}

async fn end_session(
    State(relay): State<Arc<Relay>>,
    Json(req): Json<EndRequest>,
) -> ControlResult<Ack> {
    require("session_id", &req.session_id)?;
    blocking(relay, move |relay| relay.end_session(&req.session_id)).await?;
    Ok(Json(Ack { ok: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SessionStatus, Verdict};
    use crate::relay::testing::{harness, Harness};
    use serde_json::{json, Value};

    async fn spawn_server(h: &Harness) -> (String, Arc<AtomicBool>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        tokio::spawn(serve(listener, Arc::clone(&h.relay), Arc::clone(&stop)));
        (format!("http://{}", addr), stop)
    }

    async fn post_json(base: &str, path: &str, body: Value) -> (StatusCode, Value) {
        let response = reqwest::Client::new()
            .post(format!("{}{}", base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness();
        let (base, _stop) = spawn_server(&h).await;

        let health: Health = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.bot, "relay-bot");
        assert_eq!(health.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_http() {
        let h = harness();
        let (base, _stop) = spawn_server(&h).await;

        let (status, body) = post_json(
            &base,
            "/session/start",
            json!({"session_id": "s1", "project_path": "/work/app"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        let thread_id = body["thread_id"].as_str().unwrap().to_string();

        let (status, body) = post_json(
            &base,
            "/request_approval",
            json!({"session_id": "s1", "tool_name": "bash", "command": "ls", "description": "list"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let handle = body["response_file"].as_str().unwrap().to_string();

        h.relay
            .tracker()
            .classify_reply(&thread_id, "yes", i64::MAX)
            .unwrap();
        assert_eq!(h.sinks.take(&handle), Some(Verdict::Approved));

        let (status, _) = post_json(
            &base,
            "/notification",
            json!({"session_id": "s1", "message": "done"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = post_json(
            &base,
            "/response",
            json!({"session_id": "s1", "response": "All tests pass."}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            h.gateway.posts_in(&thread_id).last().unwrap(),
            "All tests pass."
        );

        let (status, _) = post_json(&base, "/session/end", json!({"session_id": "s1"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            h.relay.store().get("s1").unwrap().status,
            SessionStatus::Ended
        );
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let h = harness();
        let (base, _stop) = spawn_server(&h).await;

        let (status, body) = post_json(
            &base,
            "/notification",
            json!({"session_id": "ghost", "message": "hi"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_approval_on_ended_session_is_409() {
        let h = harness();
        h.relay.start_session("s1", "/a").unwrap();
        h.relay.end_session("s1").unwrap();
        let (base, _stop) = spawn_server(&h).await;

        let (status, _) = post_json(
            &base,
            "/request_approval",
            json!({"session_id": "s1", "tool_name": "bash", "command": "ls"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_chat_outage_is_502() {
        let h = harness();
        let session = h.relay.start_session("s1", "/a").unwrap();
        h.gateway.fail_thread(&session.thread_id);
        let (base, _stop) = spawn_server(&h).await;

        let (status, _) = post_json(
            &base,
            "/notification",
            json!({"session_id": "s1", "message": "hi"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_blank_session_id_is_400() {
        let h = harness();
        let (base, _stop) = spawn_server(&h).await;

        let (status, body) = post_json(&base, "/session/end", json!({"session_id": " "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "session_id is required");
    }

    #[tokio::test]
    async fn test_server_stops_when_flag_set() {
        let h = harness();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let server = tokio::spawn(serve(listener, Arc::clone(&h.relay), Arc::clone(&stop)));

        stop.store(true, Ordering::Relaxed);
        let result = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[test]
    fn test_error_status_mapping() {
        let not_found = ControlError::Relay(RelayError::SessionNotFound("s1".to_string()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let inactive = ControlError::Relay(RelayError::SessionInactive {
            id: "s1".to_string(),
            status: SessionStatus::Timeout,
        });
        assert_eq!(inactive.status(), StatusCode::CONFLICT);

        let poisoned = ControlError::Relay(RelayError::Store(StoreError::Poisoned));
        assert_eq!(poisoned.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
