//! 人工审批闸门
//!
//! 同一时刻至多一个待审批的工具请求。approve / deny 都是「检查并清空」的原子操作，
//! 并发的批准与拒绝只有一个能拿到请求，另一个得到 ApprovalNotFound。

use std::sync::{Mutex, MutexGuard};

use crate::core::{AgentError, ToolRequest};

/// 待审批项：请求本身 + 发出时的对话代号（reset 后代号递增，旧决定会被编排器丢弃）
#[derive(Clone, Debug, PartialEq)]
pub struct PendingApproval {
    pub request: ToolRequest,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct ApprovalGate {
    slot: Mutex<Option<PendingApproval>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingApproval>> {
        // 临界区内没有会 panic 的代码，中毒时直接取回数据
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 放入新的待审批请求；返回被覆盖的旧请求（视为隐式拒绝，由调用方通知前端）
    pub fn offer(&self, pending: PendingApproval) -> Option<PendingApproval> {
        let displaced = self.lock().replace(pending);
        if let Some(ref old) = displaced {
            tracing::warn!(
                tool = %old.request.name,
                tool_id = %old.request.id,
                "pending tool request overwritten before a decision"
            );
        }
        displaced
    }

    pub fn approve(&self) -> Result<PendingApproval, AgentError> {
        self.lock().take().ok_or(AgentError::ApprovalNotFound)
    }

    pub fn deny(&self) -> Result<PendingApproval, AgentError> {
        self.lock().take().ok_or(AgentError::ApprovalNotFound)
    }

    /// 仅当待审批项仍是指定 id 时取出（审批超时用，避免误清掉后来的请求）
    pub fn take_if(&self, tool_id: &str) -> Option<PendingApproval> {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(p) if p.request.id == tool_id => slot.take(),
            _ => None,
        }
    }

    pub fn clear(&self) -> Option<PendingApproval> {
        self.lock().take()
    }

    pub fn pending(&self) -> Option<ToolRequest> {
        self.lock().as_ref().map(|p| p.request.clone())
    }
}
