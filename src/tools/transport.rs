//! 工具传输抽象
//!
//! 工具服务进程对外只暴露两件事：列出工具、按名调用。MCP stdio 实现见 mcp.rs，测试用内存实现见 memory.rs。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 传输层错误（进程 / IPC / 协议），与工具自身报告的失败区分开
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to start tool server: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Tool server connection closed")]
    Closed,

    #[error("Tool call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// 工具服务声明的工具（inputSchema 原样保留，由 ToolCatalog 归一化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// 工具结果中的一段内容；只关心 text，其余类型忽略
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// tools/call 的结果：有序内容段 + 工具自身的错误标志
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// 按顺序拼接所有 text 段
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Other => None,
            })
            .collect()
    }
}

#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, TransportError>;

    /// 关闭连接并结束工具服务进程；重复调用无副作用
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
