//! 模型层：客户端抽象与实现（Anthropic Messages / Mock）

pub mod anthropic;
pub mod mock;
pub mod traits;

use std::sync::Arc;

pub use anthropic::{AnthropicClient, TokenUsage};
pub use mock::{MockModelClient, RecordedRequest, ScriptedModelClient};
pub use traits::{LlmError, ModelClient, ModelReply, ModelRequest, Usage};

use crate::config::LlmSection;

/// 根据配置选择模型客户端：有 API Key 走 Anthropic，否则退回 Mock
pub fn create_model_client(cfg: &LlmSection) -> Arc<dyn ModelClient> {
    match AnthropicClient::new(cfg) {
        Ok(client) => {
            tracing::info!("Using Anthropic model ({})", cfg.model);
            Arc::new(client)
        }
        Err(e) => {
            tracing::warn!("Anthropic client unavailable ({}), using Mock model", e);
            Arc::new(MockModelClient)
        }
    }
}
