//! HTTP 接口与 SSE 事件流
//!
//! - GET  /               内嵌的单页 UI
//! - POST /chat           提交用户消息（表单字段 message）
//! - POST /tool/approve   批准待审批的工具请求
//! - POST /tool/deny      拒绝待审批的工具请求
//! - POST /reset          清空对话
//! - GET  /events         SSE：event 名为事件类型，data 为 JSON 负载
//! - GET  /api/status | /api/tools | /api/history | /api/health
//!
//! 处理器只做校验与转交，实际的轮次推进都在编排任务中完成，请求立即返回。

use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Form, Json, Router,
};
use futures_util::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, OrchestratorHandle, ToolRequest};
use crate::events::OrchestrationEvent;

#[derive(Clone)]
pub struct AppState {
    pub handle: OrchestratorHandle,
    /// 关闭时结束所有 SSE 连接
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct ChatForm {
    #[serde(default)]
    pub message: String,
}

pub fn router(handle: OrchestratorHandle, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/chat", post(chat))
        .route("/tool/approve", post(tool_approve))
        .route("/tool/deny", post(tool_deny))
        .route("/reset", post(reset))
        .route("/events", get(events))
        .route("/api/status", get(api_status))
        .route("/api/tools", get(api_tools))
        .route("/api/history", get(api_history))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(AppState { handle, shutdown })
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../../static/index.html"))
}

fn error_response(err: AgentError) -> Response {
    let status = match err {
        AgentError::EmptyMessage => StatusCode::BAD_REQUEST,
        AgentError::OrchestratorStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

/// POST /chat：消息交给编排任务，立即返回 202
async fn chat(State(state): State<AppState>, Form(form): Form<ChatForm>) -> Response {
    match state.handle.submit(&form.message) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"accepted": true}))).into_response(),
        Err(e) => error_response(e),
    }
}

fn decision_response(result: Result<ToolRequest, AgentError>) -> Response {
    match result {
        Ok(request) => Json(json!({
            "resolved": true,
            "toolId": request.id,
            "toolName": request.name,
        }))
        .into_response(),
        // reset 之后的过期点击：不是错误
        Err(e) if e.is_benign() => Json(json!({"resolved": false})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn tool_approve(State(state): State<AppState>) -> Response {
    decision_response(state.handle.approve())
}

async fn tool_deny(State(state): State<AppState>) -> Response {
    decision_response(state.handle.deny())
}

async fn reset(State(state): State<AppState>) -> Response {
    match state.handle.reset() {
        Ok(()) => Json(json!({"reset": true})).into_response(),
        Err(e) => error_response(e),
    }
}

fn to_sse(event: &OrchestrationEvent) -> Event {
    Event::default().event(event.kind()).data(event.to_json())
}

/// GET /events：先发一条 keepalive 表示已连接，之后转发总线事件（空闲时由总线注入 keepalive）
async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.handle.subscribe();
    tracing::debug!(
        subscriber = subscription.id(),
        subscribers = state.handle.bus().subscriber_count(),
        "event stream opened"
    );
    let connected = OrchestrationEvent::Keepalive {
        text: "connected".to_string(),
    };
    let stream = stream::once(async move { to_sse(&connected) })
        .chain(subscription.into_stream().map(|ev| to_sse(&ev)))
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(Ok);
    Sse::new(stream)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.handle.status())
}

async fn api_tools(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.handle.catalog().as_model_tools().to_vec())
}

async fn api_history(State(state): State<AppState>) -> Response {
    match state.handle.history().await {
        Ok(history) => Json(history).into_response(),
        Err(e) => error_response(e),
    }
}
