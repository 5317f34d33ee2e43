//! Anthropic Messages API 客户端
//!
//! 通过 reqwest 调用 /v1/messages：x-api-key + anthropic-version 头，system 为顶层字段，
//! 历史按 text / tool_use / tool_result 内容块原样发送；回复的内容块保持顺序解析。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::LlmSection;
use crate::core::ContentPart;
use crate::llm::{LlmError, ModelClient, ModelReply, ModelRequest, Usage};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// 429 既没有 retry-after 头也没有 retry_after_secs 字段时的等待秒数
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: Arc<AtomicU64>,
    pub output_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, usage: Usage) {
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed),
        )
    }
}

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    pub usage: TokenUsage,
}

impl AnthropicClient {
    pub fn new(cfg: &LlmSection) -> Result<Self, LlmError> {
        let api_key = cfg
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            usage: TokenUsage::default(),
        })
    }

    fn build_body(&self, request: &ModelRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": request.system,
            "messages": request.messages,
        });
        if let Some(tools) = request.tools {
            if !tools.is_empty() {
                body["tools"] = json!(tools);
            }
        }
        body
    }

    /// retry_after 为响应头 retry-after（秒）
    fn map_http_error(status: reqwest::StatusCode, retry_after: Option<u64>, body: &str) -> LlmError {
        let parsed = serde_json::from_str::<Value>(body).ok();
        match status.as_u16() {
            429 => LlmError::RateLimited {
                retry_after_secs: retry_after
                    .or_else(|| parsed.as_ref().and_then(|v| v["error"]["retry_after_secs"].as_u64()))
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            },
            code => LlmError::Api {
                status: code,
                message: parsed
                    .as_ref()
                    .and_then(|v| v["error"]["message"].as_str().map(String::from))
                    .unwrap_or_else(|| body.chars().take(500).collect()),
            },
        }
    }
}

/// 解析响应体：content 数组按顺序转为 ContentPart，未知块类型忽略
pub(crate) fn parse_response(body: &Value) -> Result<ModelReply, LlmError> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| LlmError::InvalidResponse("missing 'content' array".to_string()))?;

    let mut content = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                let text = block["text"].as_str().unwrap_or_default();
                content.push(ContentPart::text(text));
            }
            Some("tool_use") => {
                let id = block["id"]
                    .as_str()
                    .ok_or_else(|| LlmError::InvalidResponse("tool_use block without id".to_string()))?;
                let name = block["name"].as_str().unwrap_or_default();
                let input = match &block["input"] {
                    Value::Null => json!({}),
                    v => v.clone(),
                };
                content.push(ContentPart::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input,
                });
            }
            other => tracing::debug!(block_type = ?other, "ignoring content block"),
        }
    }

    Ok(ModelReply {
        content,
        stop_reason: body["stop_reason"].as_str().map(String::from),
        usage: Usage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
        },
    })
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, LlmError> {
        let url = format!("{}/messages", self.base_url);
        let body = self.build_body(&request);
        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.map(|t| t.len()).unwrap_or(0),
            "sending messages request"
        );

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, retry_after, &text));
        }

        let json: Value =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let reply = parse_response(&json)?;
        self.usage.add(reply.usage);
        Ok(reply)
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    fn token_usage(&self) -> (u64, u64) {
        self.usage.get()
    }
}
