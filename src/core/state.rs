//! 状态定义：编排阶段与对外投影
//!
//! 编排任务内部持有完整状态，每次状态迁移后把轻量的 StatusSnapshot 通过 watch 通道投影出去，
//! 供 /api/status 与命令行客户端读取。

use serde::Serialize;

use crate::core::ToolRequest;

/// 编排阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    /// 空闲，等待用户消息
    Idle,
    /// 等待模型返回
    AwaitingModel,
    /// 等待人工批准 / 拒绝
    AwaitingApproval,
    /// 工具执行中
    Executing,
    /// 轮数耗尽后的总结轮
    Summarizing,
    /// 上一轮模型请求失败；历史未变，下一条用户消息重新开始
    Failed,
}

impl AgentPhase {
    /// 此阶段是否有模型或工具调用在途
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            AgentPhase::AwaitingModel | AgentPhase::Executing | AgentPhase::Summarizing
        )
    }

    /// 本次用户请求是否已结束
    pub fn is_settled(&self) -> bool {
        matches!(self, AgentPhase::Idle | AgentPhase::Failed)
    }
}

/// 对外投影的状态快照
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub phase: AgentPhase,
    pub turns: usize,
    pub max_turns: usize,
    pub messages: usize,
    pub pending: Option<ToolRequest>,
    /// 本次请求中还排队等待审批的工具数（不含 pending）
    pub queued: usize,
    /// 已结束（成功、总结或失败）的用户请求累计数
    pub completed: u64,
}

impl StatusSnapshot {
    pub fn idle(max_turns: usize) -> Self {
        Self {
            phase: AgentPhase::Idle,
            turns: 0,
            max_turns,
            messages: 0,
            pending: None,
            queued: 0,
            completed: 0,
        }
    }
}
