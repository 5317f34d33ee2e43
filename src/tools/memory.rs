//! 进程内工具传输（测试与离线演示用）

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{CallToolResult, ToolDescriptor, ToolTransport, TransportError};

type Handler = Arc<dyn Fn(&Value) -> Result<CallToolResult, TransportError> + Send + Sync>;

/// 以闭包注册工具；记录每次调用，可选人为延迟
#[derive(Default)]
pub struct InMemoryTransport {
    descriptors: Vec<ToolDescriptor>,
    handlers: HashMap<String, Handler>,
    calls: Mutex<Vec<(String, Value)>>,
    delay: Option<Duration>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool<F>(mut self, descriptor: ToolDescriptor, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<CallToolResult, TransportError> + Send + Sync + 'static,
    {
        self.handlers.insert(descriptor.name.clone(), Arc::new(handler));
        self.descriptors.push(descriptor);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 已发生的调用（工具名, 参数）
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ToolTransport for InMemoryTransport {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        Ok(self.descriptors.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), arguments.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let handler = self
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::UnknownTool(name.to_string()))?;
        handler(&arguments)
    }
}
