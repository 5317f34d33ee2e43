//! Agent 运行时装配
//!
//! 启动工具服务、加载工具目录、选择模型客户端、创建事件总线并启动编排任务。
//! Web 服务与命令行客户端共用这一套装配逻辑。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{spawn_orchestrator, AgentError, OrchestratorConfig, OrchestratorHandle};
use crate::events::EventBus;
use crate::llm::{create_model_client, ModelClient};
use crate::tools::{McpStdioTransport, ToolCatalog, ToolExecutor, ToolTransport};

/// 已启动的运行时：编排器句柄 + 需要在退出时关闭的工具传输
pub struct AgentRuntime {
    pub handle: OrchestratorHandle,
    pub transport: Arc<dyn ToolTransport>,
    pub model: Arc<dyn ModelClient>,
}

/// 用给定的传输与模型装配运行时（测试可传入内存实现）
pub async fn start_with(
    cfg: &AppConfig,
    transport: Arc<dyn ToolTransport>,
    model: Arc<dyn ModelClient>,
) -> Result<AgentRuntime, AgentError> {
    let descriptors = transport.list_tools().await?;
    let catalog = Arc::new(ToolCatalog::from_descriptors(descriptors)?);
    if catalog.is_empty() {
        tracing::warn!("tool server advertised no tools");
    }
    tracing::info!(tools = ?catalog.tool_names(), "tools available");

    let bus = EventBus::new(
        cfg.server.event_buffer,
        Duration::from_secs(cfg.server.keepalive_secs.max(1)),
    );
    let executor = ToolExecutor::new(
        transport.clone(),
        catalog,
        bus.clone(),
        Duration::from_secs(cfg.tools.tool_timeout_secs),
    );
    let handle = spawn_orchestrator(
        OrchestratorConfig::from_agent_section(&cfg.agent),
        model.clone(),
        executor,
        bus,
    );
    Ok(AgentRuntime {
        handle,
        transport,
        model,
    })
}

/// 按配置启动 MCP 工具服务与模型客户端
pub async fn start_agent(cfg: &AppConfig) -> Result<AgentRuntime, AgentError> {
    let transport = McpStdioTransport::spawn(&cfg.tools.server_path, &cfg.tools.server_args).await?;
    let transport: Arc<dyn ToolTransport> = Arc::new(transport);
    let model = create_model_client(&cfg.llm);
    match start_with(cfg, transport.clone(), model).await {
        Ok(runtime) => Ok(runtime),
        Err(e) => {
            let _ = transport.close().await;
            Err(e)
        }
    }
}
