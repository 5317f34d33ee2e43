//! Mock 模型客户端（无需 API Key）
//!
//! - MockModelClient：离线演示用，先请求一个无必填参数的工具，拿到结果后用文字复述，便于本地跑通审批流程
//! - ScriptedModelClient：测试用，按预设顺序返回回复并记录每次请求

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::core::{ContentPart, Message, Role};
use crate::llm::{LlmError, ModelClient, ModelReply, ModelRequest};

/// 离线 Mock
#[derive(Debug, Default)]
pub struct MockModelClient;

#[async_trait]
impl ModelClient for MockModelClient {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, LlmError> {
        let last = request.messages.last();

        // 上一轮是工具结果：复述结果，结束本次请求
        let result = last
            .filter(|m| m.role == Role::User)
            .and_then(|m| {
                m.content.iter().rev().find_map(|p| match p {
                    ContentPart::ToolResult { content, is_error, .. } => Some((content.clone(), *is_error)),
                    _ => None,
                })
            });
        if let Some((content, is_error)) = result {
            let text = if is_error {
                format!("(mock) The tool call did not succeed: {}", content)
            } else {
                format!("(mock) The tool returned:\n{}", content)
            };
            return Ok(reply(vec![ContentPart::text(text)]));
        }

        let user_text = last
            .and_then(|m| {
                m.content.iter().rev().find_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
            })
            .unwrap_or("(no input)");

        let tool = request
            .tools
            .and_then(|tools| tools.iter().find(|t| t.input_schema.required.is_empty()));
        match tool {
            Some(tool) => Ok(reply(vec![
                ContentPart::text(format!("(mock) You asked: {}. Let me call {}.", user_text, tool.name)),
                ContentPart::ToolUse {
                    id: format!("toolu_mock_{}", uuid::Uuid::new_v4().simple()),
                    name: tool.name.clone(),
                    input: json!({}),
                },
            ])),
            None => Ok(reply(vec![ContentPart::text(format!("(mock) Echo: {}", user_text))])),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn reply(content: Vec<ContentPart>) -> ModelReply {
    ModelReply {
        content,
        ..ModelReply::default()
    }
}

/// 测试记录的一次请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub system: String,
    pub messages: Vec<Message>,
    /// None 表示该轮没有附带工具
    pub tool_names: Option<Vec<String>>,
}

/// 脚本化客户端：依次弹出预设回复；脚本用完返回 ScriptExhausted
#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<Result<ModelReply, LlmError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, content: Vec<ContentPart>) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(reply(content)));
        self
    }

    pub fn push_text(&self, text: &str) -> &Self {
        self.push_reply(vec![ContentPart::text(text)])
    }

    pub fn push_error(&self, err: LlmError) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(err));
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedRequest {
                system: request.system.to_string(),
                messages: request.messages.to_vec(),
                tool_names: request
                    .tools
                    .map(|tools| tools.iter().map(|t| t.name.clone()).collect()),
            });
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(Err(LlmError::ScriptExhausted))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
