//! 工具执行器
//!
//! 持有传输、目录、事件总线与超时。execute 先发 tool-executing，再在超时内调用传输，
//! 把结果归为三类：成功、工具自身失败（isError）、传输失败（进程 / 协议 / 超时 / 未知工具），
//! 并输出结构化审计日志（JSON）。execute 永不返回错误，任何失败都折叠进 ToolOutcome。
//!
//! 编排器分开调用 announce / run / publish_outcome：结果事件要在确认对话代号仍有效之后才发出。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::ToolRequest;
use crate::events::{EventBus, OrchestrationEvent};
use crate::tools::{ToolCatalog, ToolTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    ToolFailed,
    TransportFailed,
}

/// 一次工具调用的归一化结果，text 即回灌给模型的 tool_result 内容
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub tool_id: String,
    pub tool_name: String,
    pub text: String,
    pub kind: OutcomeKind,
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        self.kind != OutcomeKind::Success
    }
}

#[derive(Clone)]
pub struct ToolExecutor {
    transport: Arc<dyn ToolTransport>,
    catalog: Arc<ToolCatalog>,
    bus: EventBus,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(transport: Arc<dyn ToolTransport>, catalog: Arc<ToolCatalog>, bus: EventBus, timeout: Duration) -> Self {
        Self {
            transport,
            catalog,
            bus,
            timeout,
        }
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    /// announce + run + publish_outcome
    pub async fn execute(&self, request: &ToolRequest) -> ToolOutcome {
        self.announce(request);
        let outcome = self.run(request).await;
        self.publish_outcome(&outcome);
        outcome
    }

    /// 发布 tool-executing
    pub fn announce(&self, request: &ToolRequest) {
        self.bus.publish(OrchestrationEvent::ToolExecuting {
            tool_id: request.id.clone(),
            tool_name: request.name.clone(),
        });
    }

    /// 调用工具并写审计日志，不发布任何事件
    pub async fn run(&self, request: &ToolRequest) -> ToolOutcome {
        let start = Instant::now();
        let result = if self.catalog.contains(&request.name) {
            match timeout(self.timeout, self.transport.call_tool(&request.name, request.arguments.clone())).await {
                Ok(r) => r,
                Err(_) => Err(TransportError::Timeout(self.timeout)),
            }
        } else {
            Err(TransportError::UnknownTool(request.name.clone()))
        };

        let outcome = match result {
            Ok(call) if call.is_error => ToolOutcome {
                tool_id: request.id.clone(),
                tool_name: request.name.clone(),
                text: format!("Tool '{}' execution failed: {}", request.name, call.text()),
                kind: OutcomeKind::ToolFailed,
            },
            Ok(call) => {
                let text = call.text();
                if text.is_empty() {
                    tracing::warn!(tool = %request.name, "tool returned no text content");
                }
                ToolOutcome {
                    tool_id: request.id.clone(),
                    tool_name: request.name.clone(),
                    text,
                    kind: OutcomeKind::Success,
                }
            }
            Err(e) => ToolOutcome {
                tool_id: request.id.clone(),
                tool_name: request.name.clone(),
                text: format!("Error: {}", e),
                kind: OutcomeKind::TransportFailed,
            },
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": request.name,
            "tool_id": request.id,
            "ok": !outcome.is_error(),
            "outcome": match outcome.kind {
                OutcomeKind::Success => "ok",
                OutcomeKind::ToolFailed => "tool_error",
                OutcomeKind::TransportFailed => "transport_error",
            },
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&request.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        outcome
    }

    /// 发布 tool-result；传输失败时先发 error
    pub fn publish_outcome(&self, outcome: &ToolOutcome) {
        if outcome.kind == OutcomeKind::TransportFailed {
            self.bus.publish(OrchestrationEvent::Error {
                text: format!("Tool '{}' could not be invoked: {}", outcome.tool_name, outcome.text),
            });
        }
        self.bus.publish(OrchestrationEvent::ToolResult {
            tool_id: outcome.tool_id.clone(),
            text: outcome.text.clone(),
            is_error: outcome.is_error(),
        });
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
