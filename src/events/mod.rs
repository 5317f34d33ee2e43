//! 编排事件：用于 SSE 推送用户消息、模型叙述、工具请求 / 执行 / 结果、拒绝、错误与重置
//!
//! 事件只投递给当前订阅者，不持久化。

pub mod bus;

use serde::Serialize;

use crate::core::ToolRequest;

pub use bus::{EventBus, EventStream};

/// 单个编排事件
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationEvent {
    UserMessage { text: String },
    AssistantMessage { text: String },
    ToolRequest { request: ToolRequest },
    ToolExecuting { tool_id: String, tool_name: String },
    ToolResult { tool_id: String, text: String, is_error: bool },
    ToolDenied { tool_id: String, tool_name: String, reason: String },
    Error { text: String },
    Reset,
    Keepalive { text: String },
}

/// 推送给前端的 JSON 负载：`{kind, role?, text?, toolId?, toolName?, toolArgsJSON?}`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(rename = "toolArgsJSON", skip_serializing_if = "Option::is_none")]
    pub tool_args_json: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl OrchestrationEvent {
    /// SSE event 名
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationEvent::UserMessage { .. } => "user-message",
            OrchestrationEvent::AssistantMessage { .. } => "assistant-message",
            OrchestrationEvent::ToolRequest { .. } => "tool-request",
            OrchestrationEvent::ToolExecuting { .. } => "tool-executing",
            OrchestrationEvent::ToolResult { .. } => "tool-result",
            OrchestrationEvent::ToolDenied { .. } => "tool-denied",
            OrchestrationEvent::Error { .. } => "error",
            OrchestrationEvent::Reset => "reset",
            OrchestrationEvent::Keepalive { .. } => "keepalive",
        }
    }

    /// 人类可读的一行描述（日志与终端客户端使用）
    pub fn render(&self) -> String {
        match self {
            OrchestrationEvent::UserMessage { text } => format!("You: {}", text),
            OrchestrationEvent::AssistantMessage { text } => text.clone(),
            OrchestrationEvent::ToolRequest { request } => format!(
                "Tool request: {} {}",
                request.name,
                request.arguments
            ),
            OrchestrationEvent::ToolExecuting { tool_name, .. } => format!("Executing {}...", tool_name),
            OrchestrationEvent::ToolResult { text, is_error, .. } => {
                if *is_error {
                    format!("Tool failed: {}", text)
                } else {
                    format!("Tool result: {}", text)
                }
            }
            OrchestrationEvent::ToolDenied { tool_name, reason, .. } => {
                format!("Tool {} denied: {}", tool_name, reason)
            }
            OrchestrationEvent::Error { text } => format!("Error: {}", text),
            OrchestrationEvent::Reset => "Conversation reset.".to_string(),
            OrchestrationEvent::Keepalive { text } => text.clone(),
        }
    }

    pub fn payload(&self) -> EventPayload {
        let mut p = EventPayload {
            kind: self.kind(),
            role: None,
            text: None,
            tool_id: None,
            tool_name: None,
            tool_args_json: None,
            is_error: false,
            at: chrono::Utc::now(),
        };
        match self {
            OrchestrationEvent::UserMessage { text } => {
                p.role = Some("user");
                p.text = Some(text.clone());
            }
            OrchestrationEvent::AssistantMessage { text } => {
                p.role = Some("assistant");
                p.text = Some(text.clone());
            }
            OrchestrationEvent::ToolRequest { request } => {
                p.role = Some("tool-request");
                p.tool_id = Some(request.id.clone());
                p.tool_name = Some(request.name.clone());
                p.tool_args_json = Some(request.arguments_pretty());
            }
            OrchestrationEvent::ToolExecuting { tool_id, tool_name } => {
                p.tool_id = Some(tool_id.clone());
                p.tool_name = Some(tool_name.clone());
            }
            OrchestrationEvent::ToolResult { tool_id, text, is_error } => {
                p.tool_id = Some(tool_id.clone());
                p.text = Some(text.clone());
                p.is_error = *is_error;
            }
            OrchestrationEvent::ToolDenied { tool_id, tool_name, .. } => {
                p.role = Some("system");
                p.tool_id = Some(tool_id.clone());
                p.tool_name = Some(tool_name.clone());
                p.text = Some(self.render());
            }
            OrchestrationEvent::Error { .. } => {
                p.role = Some("error");
                p.text = Some(self.render());
            }
            OrchestrationEvent::Reset => {}
            OrchestrationEvent::Keepalive { text } => p.text = Some(text.clone()),
        }
        p
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.payload()).unwrap_or_else(|_| format!("{{\"kind\":\"{}\"}}", self.kind()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_request_payload_shape() {
        let ev = OrchestrationEvent::ToolRequest {
            request: ToolRequest {
                id: "toolu_01".to_string(),
                name: "Reactivate_agent".to_string(),
                arguments: json!({"agent_uuid": "abc"}),
            },
        };
        let v: serde_json::Value = serde_json::from_str(&ev.to_json()).unwrap();
        assert_eq!(v["kind"], "tool-request");
        assert_eq!(v["toolId"], "toolu_01");
        assert_eq!(v["toolName"], "Reactivate_agent");
        assert!(v["toolArgsJSON"].as_str().unwrap().contains("agent_uuid"));
        assert!(v.get("isError").is_none());
    }

    #[test]
    fn test_error_and_denied_render_text() {
        let ev = OrchestrationEvent::ToolDenied {
            tool_id: "t".to_string(),
            tool_name: "Reactivate_agent".to_string(),
            reason: "denied by user".to_string(),
        };
        assert_eq!(ev.kind(), "tool-denied");
        assert!(ev.payload().text.unwrap().contains("denied by user"));

        let err = OrchestrationEvent::Error { text: "model down".to_string() };
        assert_eq!(err.payload().text.as_deref(), Some("Error: model down"));
    }
}
