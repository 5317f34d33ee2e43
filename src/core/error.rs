//! Agent 错误类型
//!
//! 只有模型请求失败会终止当前轮次；工具失败被转成带 is_error 的 tool_result 回灌给模型，不走这里。

use thiserror::Error;

use crate::llm::LlmError;
use crate::tools::{CatalogError, TransportError};

/// 编排器对外暴露的错误（HTTP 处理器、CLI 据此给出提示）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Model request failed: {0}")]
    ModelRequest(#[from] LlmError),

    #[error("Tool transport error: {0}")]
    ToolTransport(#[from] TransportError),

    #[error("Tool catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// 没有待审批的工具请求（通常是 reset 之后的过期操作，前端当作无操作处理）
    #[error("No pending tool request")]
    ApprovalNotFound,

    #[error("Message must not be empty")]
    EmptyMessage,

    /// 编排任务已退出（关闭中）
    #[error("Orchestrator is not running")]
    OrchestratorStopped,
}

impl AgentError {
    /// 是否是预期内、对用户无害的情况（不显示为错误）
    pub fn is_benign(&self) -> bool {
        matches!(self, AgentError::ApprovalNotFound)
    }
}
