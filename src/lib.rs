//! Keylime Agent - 工具调用需人工审批的对话式运维智能体
//!
//! 模块划分：
//! - **agent**: 运行时装配（工具服务 + 模型 + 编排任务）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 对话历史、审批闸门、编排状态机、错误与关闭
//! - **events**: 编排事件与事件总线（SSE 推送）
//! - **llm**: 模型客户端抽象与实现（Anthropic Messages / Mock）
//! - **observability**: 日志初始化
//! - **tools**: 工具目录、MCP stdio 传输、工具执行器
//! - **web**: HTTP 接口与 SSE 事件流

pub mod agent;
pub mod config;
pub mod core;
pub mod events;
pub mod llm;
pub mod observability;
pub mod tools;
pub mod web;

pub use agent::{start_agent, start_with, AgentRuntime};
