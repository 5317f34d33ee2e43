//! 模型客户端抽象
//!
//! 一次 complete 即一轮：系统提示 + 完整历史 + （可选）工具列表 -> 按到达顺序排列的内容块（叙述与 tool_use）。

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::core::{ContentPart, Message};
use crate::tools::ModelToolSpec;

/// 模型请求错误
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API key not configured")]
    MissingApiKey,

    #[error("Request failed: {0}")]
    Request(String),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Script exhausted")]
    ScriptExhausted,
}

/// 单轮请求（借用编排器的历史，不复制）
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [Message],
    /// None 表示不给模型任何工具（总结轮）
    pub tools: Option<&'a [ModelToolSpec]>,
}

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// 单轮回复：内容块按模型输出顺序排列
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub content: Vec<ContentPart>,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

impl ModelReply {
    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(|p| matches!(p, ContentPart::ToolUse { .. }))
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, LlmError>;

    /// 客户端名称，用于日志
    fn name(&self) -> &str;

    /// 累计 token 使用统计：(input, output)；默认 (0, 0)
    fn token_usage(&self) -> (u64, u64) {
        (0, 0)
    }
}
