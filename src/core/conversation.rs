//! 对话历史
//!
//! 按序保存 user / assistant 消息，每轮原样回放给模型。assistant 轮可同时包含叙述与多个 tool_use，
//! 紧随其后的 user 轮按序批量放入对应的 tool_result；user 轮在 assistant 回复之前保持「开放」，
//! 后续的 tool_result 或用户文本都并入同一轮，保证角色严格交替。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色（与 Messages API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// 消息内容块：叙述文本 / 工具调用请求 / 工具结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        ContentPart::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn assistant(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// 本条消息中的 tool_use 请求（按出现顺序）
    pub fn tool_uses(&self) -> impl Iterator<Item = ToolRequest> + '_ {
        self.content.iter().filter_map(ToolRequest::from_part)
    }
}

/// 模型发出的一次工具调用请求（id 由模型分配，用于与 tool_result 对应）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolRequest {
    pub fn from_part(part: &ContentPart) -> Option<Self> {
        match part {
            ContentPart::ToolUse { id, name, input } => Some(Self {
                id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            }),
            _ => None,
        }
    }

    /// 参数的格式化 JSON，用于展示
    pub fn arguments_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.arguments).unwrap_or_else(|_| self.arguments.to_string())
    }
}

/// 对话状态：有序历史 + 本次用户请求内已发起的模型轮数
#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    messages: Vec<Message>,
    turns: usize,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加用户文本；若末尾是尚未被回复的 user 轮则并入该轮
    pub fn append_user(&mut self, text: impl Into<String>) {
        self.push_user_part(ContentPart::text(text));
    }

    /// 追加 assistant 轮；空内容不入历史（Messages API 不接受空 assistant 轮）
    pub fn append_assistant(&mut self, parts: Vec<ContentPart>) -> bool {
        if parts.is_empty() {
            return false;
        }
        self.messages.push(Message::assistant(parts));
        true
    }

    /// 追加工具结果；同一 assistant 轮的多个结果批量放在紧随其后的一个 user 轮中
    pub fn append_tool_result(&mut self, tool_use_id: impl Into<String>, text: impl Into<String>, is_error: bool) {
        self.push_user_part(ContentPart::tool_result(tool_use_id, text, is_error));
    }

    fn push_user_part(&mut self, part: ContentPart) {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::User => last.content.push(part),
            _ => self.messages.push(Message {
                role: Role::User,
                content: vec![part],
            }),
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    pub fn reset(&mut self) {
        self.messages.clear();
        self.turns = 0;
    }

    /// 新的用户请求开始，轮数从 0 计
    pub fn begin_request(&mut self) {
        self.turns = 0;
    }

    /// 记录一次（带工具列表的）模型轮次，返回当前轮数
    pub fn record_round(&mut self) -> usize {
        self.turns += 1;
        self.turns
    }

    pub fn turns(&self) -> usize {
        self.turns
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 最后一个 assistant 轮中尚未得到 tool_result 的 tool_use id
    pub fn unresolved_tool_uses(&self) -> Vec<String> {
        let Some(idx) = self.messages.iter().rposition(|m| m.role == Role::Assistant) else {
            return Vec::new();
        };
        let answered: Vec<&str> = self.messages[idx + 1..]
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|p| match p {
                ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        self.messages[idx]
            .tool_uses()
            .map(|r| r.id)
            .filter(|id| !answered.contains(&id.as_str()))
            .collect()
    }
}
