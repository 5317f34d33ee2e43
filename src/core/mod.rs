//! 核心编排层：对话历史、审批闸门、状态投影、主控循环、错误与关闭

pub mod approval;
pub mod conversation;
pub mod error;
pub mod orchestrator;
pub mod shutdown;
pub mod state;

pub use approval::{ApprovalGate, PendingApproval};
pub use conversation::{ContentPart, ConversationState, Message, Role, ToolRequest};
pub use error::AgentError;
pub use orchestrator::{denial_text, spawn_orchestrator, Command, OrchestratorConfig, OrchestratorHandle};
pub use shutdown::{OrchestratorCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason, ToolServerCleanup};
pub use state::{AgentPhase, StatusSnapshot};
