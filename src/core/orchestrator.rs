//! 编排器：主控循环
//!
//! 单个后台任务独占 ConversationState，消费两类输入：
//! - 用户命令（提交 / 批准 / 拒绝 / 重置 / 退出），由 OrchestratorHandle 发送；
//! - 内部完成通知（模型返回、工具执行完成、审批超时），由本任务派生的子任务回送。
//!
//! 模型请求与工具调用都在子任务中进行，主循环从不阻塞；每轮带上对话代号（generation），
//! reset 之后代号递增，旧代号的完成通知一律丢弃，不会写进已清空的对话。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::core::{
    AgentError, AgentPhase, ApprovalGate, ContentPart, ConversationState, Message, PendingApproval,
    StatusSnapshot, ToolRequest,
};
use crate::events::{EventBus, EventStream, OrchestrationEvent};
use crate::llm::{LlmError, ModelClient, ModelReply, ModelRequest};
use crate::tools::{ToolCatalog, ToolExecutor, ToolOutcome};

/// 从处理器发往编排任务的命令
#[derive(Debug)]
pub enum Command {
    /// 新的用户消息
    Submit(String),
    /// 已从审批闸门取出并批准的请求
    Approved(PendingApproval),
    /// 已从审批闸门取出并拒绝的请求
    Denied(PendingApproval),
    /// 清空对话
    Reset,
    /// 读取当前历史（测试与 /api/history）
    History(oneshot::Sender<Vec<Message>>),
    /// 退出主循环
    Shutdown,
}

/// 子任务回送的完成通知
#[derive(Debug)]
enum Completion {
    ModelReplied {
        generation: u64,
        summary: bool,
        result: Result<ModelReply, LlmError>,
    },
    ToolFinished {
        generation: u64,
        outcome: ToolOutcome,
    },
    ApprovalExpired {
        generation: u64,
        tool_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub system_prompt: String,
    pub summary_prompt: String,
    /// 单次用户请求内带工具的模型轮数上限，达到后发起总结轮
    pub max_turns: usize,
    /// None 表示无限期等待人工决定
    pub approval_timeout: Option<Duration>,
}

impl OrchestratorConfig {
    pub fn from_agent_section(agent: &crate::config::AgentSection) -> Self {
        Self {
            system_prompt: agent.system_prompt(),
            summary_prompt: agent.summary_prompt(),
            max_turns: agent.max_turns,
            approval_timeout: agent.approval_timeout(),
        }
    }
}

/// 拒绝时回灌给模型的合成结果
pub fn denial_text(tool_name: &str) -> String {
    format!(
        "The user denied execution of tool '{}'. Continue without its result.",
        tool_name
    )
}

/// 编排器句柄：处理器通过它提交操作；可廉价克隆
#[derive(Clone)]
pub struct OrchestratorHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    gate: Arc<ApprovalGate>,
    bus: EventBus,
    status_rx: watch::Receiver<StatusSnapshot>,
    catalog: Arc<ToolCatalog>,
}

impl OrchestratorHandle {
    fn send(&self, cmd: Command) -> Result<(), AgentError> {
        self.cmd_tx.send(cmd).map_err(|_| AgentError::OrchestratorStopped)
    }

    /// 提交用户消息；若有待审批请求，先在闸门上取走它，之后的批准 / 拒绝得到 ApprovalNotFound，
    /// 编排任务随后把它记为被新消息取代
    pub fn submit(&self, text: &str) -> Result<(), AgentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::EmptyMessage);
        }
        if let Some(superseded) = self.gate.clear() {
            tracing::debug!(tool_id = %superseded.request.id, "pending tool superseded by new message");
        }
        self.send(Command::Submit(text.to_string()))
    }

    /// 原子地取出待审批请求并交给编排任务执行
    pub fn approve(&self) -> Result<ToolRequest, AgentError> {
        let pending = self.gate.approve()?;
        let request = pending.request.clone();
        self.send(Command::Approved(pending))?;
        Ok(request)
    }

    pub fn deny(&self) -> Result<ToolRequest, AgentError> {
        let pending = self.gate.deny()?;
        let request = pending.request.clone();
        self.send(Command::Denied(pending))?;
        Ok(request)
    }

    /// 任意状态下都可调用；先清空闸门，使之后的批准 / 拒绝立即得到 ApprovalNotFound
    pub fn reset(&self) -> Result<(), AgentError> {
        self.gate.clear();
        self.send(Command::Reset)
    }

    pub async fn history(&self) -> Result<Vec<Message>, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::History(tx))?;
        rx.await.map_err(|_| AgentError::OrchestratorStopped)
    }

    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_rx.clone()
    }

    pub fn pending(&self) -> Option<ToolRequest> {
        self.gate.pending()
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

struct Orchestrator {
    cfg: OrchestratorConfig,
    model: Arc<dyn ModelClient>,
    executor: ToolExecutor,
    catalog: Arc<ToolCatalog>,
    gate: Arc<ApprovalGate>,
    bus: EventBus,
    status_tx: watch::Sender<StatusSnapshot>,
    done_tx: mpsc::UnboundedSender<Completion>,
    conversation: ConversationState,
    phase: AgentPhase,
    generation: u64,
    /// 当前已交给闸门、等待人工决定的请求
    awaiting: Option<ToolRequest>,
    /// 同一 assistant 轮中排在后面的请求
    queue: VecDeque<ToolRequest>,
    completed: u64,
}

/// 创建编排任务并返回句柄
pub fn spawn_orchestrator(
    mut cfg: OrchestratorConfig,
    model: Arc<dyn ModelClient>,
    executor: ToolExecutor,
    bus: EventBus,
) -> OrchestratorHandle {
    if cfg.max_turns == 0 {
        tracing::warn!("max_turns is 0, using 1");
        cfg.max_turns = 1;
    }
    let catalog = executor.catalog().clone();
    let gate = Arc::new(ApprovalGate::new());
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
    let (status_tx, status_rx) = watch::channel(StatusSnapshot::idle(cfg.max_turns));

    let mut orch = Orchestrator {
        cfg,
        model,
        executor,
        catalog: catalog.clone(),
        gate: gate.clone(),
        bus: bus.clone(),
        status_tx,
        done_tx,
        conversation: ConversationState::new(),
        phase: AgentPhase::Idle,
        generation: 0,
        awaiting: None,
        queue: VecDeque::new(),
        completed: 0,
    };

    tokio::spawn(async move {
        tracing::info!(model = orch.model.name(), tools = orch.catalog.len(), "orchestrator started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => orch.handle_command(cmd),
                },
                Some(done) = done_rx.recv() => orch.handle_completion(done),
            }
        }
        orch.gate.clear();
        tracing::info!("orchestrator stopped");
    });

    OrchestratorHandle {
        cmd_tx,
        gate,
        bus,
        status_rx,
        catalog,
    }
}

impl Orchestrator {
    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit(text) => self.on_submit(text),
            Command::Approved(pending) => self.on_approved(pending),
            Command::Denied(pending) => {
                if self.is_current(&pending) {
                    self.resolve_denied(pending.request, "denied by user");
                } else {
                    tracing::debug!(tool_id = %pending.request.id, "ignoring stale denial");
                }
            }
            Command::Reset => self.on_reset(),
            Command::History(reply) => {
                let _ = reply.send(self.conversation.history().to_vec());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::ModelReplied { generation, summary, result } => {
                if generation != self.generation {
                    tracing::debug!(generation, current = self.generation, "dropping stale model reply");
                    return;
                }
                self.on_model_reply(summary, result);
            }
            Completion::ToolFinished { generation, outcome } => {
                if generation != self.generation {
                    tracing::debug!(generation, tool = %outcome.tool_name, "dropping stale tool result");
                    return;
                }
                self.executor.publish_outcome(&outcome);
                self.conversation
                    .append_tool_result(outcome.tool_id.clone(), outcome.text.clone(), outcome.is_error());
                self.continue_after_tool();
            }
            Completion::ApprovalExpired { generation, tool_id } => {
                if generation != self.generation {
                    return;
                }
                if let Some(pending) = self.gate.take_if(&tool_id) {
                    tracing::warn!(tool = %pending.request.name, tool_id = %tool_id, "approval timed out, denying");
                    self.resolve_denied(pending.request, "approval timed out");
                }
            }
        }
    }

    /// 决定是否属于当前代号、当前等待中的请求
    fn is_current(&self, pending: &PendingApproval) -> bool {
        pending.generation == self.generation
            && self.phase == AgentPhase::AwaitingApproval
            && self.awaiting.as_ref().map(|r| r.id == pending.request.id).unwrap_or(false)
    }

    fn on_submit(&mut self, text: String) {
        if self.phase.is_busy() {
            tracing::info!(phase = ?self.phase, "message rejected while busy");
            self.bus.publish(OrchestrationEvent::Error {
                text: "Still working on the previous request, please wait.".to_string(),
            });
            return;
        }

        if self.phase == AgentPhase::AwaitingApproval {
            // 未决的 tool_use 必须先有结果，否则下一轮会被模型拒绝
            self.gate.clear();
            let outstanding: Vec<ToolRequest> = self.awaiting.take().into_iter().chain(self.queue.drain(..)).collect();
            for request in outstanding {
                self.record_denial(&request, "superseded by a new message");
            }
        }

        self.conversation.append_user(text.clone());
        self.bus.publish(OrchestrationEvent::UserMessage { text });
        self.conversation.begin_request();
        self.dispatch_round(false);
    }

    fn on_approved(&mut self, pending: PendingApproval) {
        if !self.is_current(&pending) {
            tracing::debug!(tool_id = %pending.request.id, "ignoring stale approval");
            return;
        }
        self.awaiting = None;
        self.phase = AgentPhase::Executing;
        self.publish_status();

        let request = pending.request;
        self.executor.announce(&request);
        let executor = self.executor.clone();
        let done_tx = self.done_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let outcome = executor.run(&request).await;
            let _ = done_tx.send(Completion::ToolFinished { generation, outcome });
        });
    }

    fn on_reset(&mut self) {
        self.generation += 1;
        self.gate.clear();
        self.awaiting = None;
        self.queue.clear();
        self.conversation.reset();
        self.phase = AgentPhase::Idle;
        tracing::info!(generation = self.generation, "conversation reset");
        self.bus.publish(OrchestrationEvent::Reset);
        self.publish_status();
    }

    /// 发起一轮模型请求；summary 轮追加固定提示且不带工具列表
    fn dispatch_round(&mut self, summary: bool) {
        if summary {
            self.conversation.append_user(self.cfg.summary_prompt.clone());
            self.phase = AgentPhase::Summarizing;
            tracing::info!(turns = self.conversation.turns(), "turn budget reached, requesting summary");
        } else {
            let turn = self.conversation.record_round();
            self.phase = AgentPhase::AwaitingModel;
            tracing::debug!(turn, max_turns = self.cfg.max_turns, "dispatching model round");
        }
        self.publish_status();

        // 每个 tool_use 都必须已有 tool_result，否则 Messages API 会拒绝这一轮
        debug_assert!(
            self.conversation.unresolved_tool_uses().is_empty(),
            "dispatching a model round with unresolved tool uses"
        );

        let model = self.model.clone();
        let catalog = self.catalog.clone();
        let system = self.cfg.system_prompt.clone();
        let history = self.conversation.history().to_vec();
        let done_tx = self.done_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let tools = if summary { None } else { Some(catalog.as_model_tools()) };
            let result = model
                .complete(ModelRequest {
                    system: &system,
                    messages: &history,
                    tools,
                })
                .await;
            let _ = done_tx.send(Completion::ModelReplied { generation, summary, result });
        });
    }

    fn on_model_reply(&mut self, summary: bool, result: Result<ModelReply, LlmError>) {
        let reply = match result {
            Ok(reply) => {
                tracing::debug!(parts = reply.content.len(), tool_use = reply.has_tool_use(), summary, "model replied");
                reply
            }
            Err(e) => {
                tracing::error!(error = %e, "model request failed");
                self.bus.publish(OrchestrationEvent::Error { text: e.to_string() });
                self.phase = AgentPhase::Failed;
                self.completed += 1;
                self.publish_status();
                return;
            }
        };

        let mut parts = Vec::with_capacity(reply.content.len());
        for part in reply.content {
            match &part {
                ContentPart::Text { text } => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    self.bus.publish(OrchestrationEvent::AssistantMessage { text: text.clone() });
                }
                ContentPart::ToolUse { name, .. } if summary => {
                    tracing::warn!(tool = %name, "ignoring tool request in summary round");
                    continue;
                }
                ContentPart::ToolUse { .. } => {
                    if let Some(request) = ToolRequest::from_part(&part) {
                        self.queue.push_back(request);
                    }
                }
                ContentPart::ToolResult { .. } => {
                    tracing::warn!("ignoring tool_result block in model reply");
                    continue;
                }
            }
            parts.push(part);
        }
        self.conversation.append_assistant(parts);

        if self.queue.is_empty() {
            self.phase = AgentPhase::Idle;
            self.completed += 1;
            tracing::debug!(turns = self.conversation.turns(), summary, "request finished");
            self.publish_status();
        } else {
            self.offer_next();
        }
    }

    /// 把队首请求交给审批闸门
    fn offer_next(&mut self) {
        let Some(request) = self.queue.pop_front() else {
            return;
        };
        let pending = PendingApproval {
            request: request.clone(),
            generation: self.generation,
        };
        if let Some(displaced) = self.gate.offer(pending) {
            self.record_denial(&displaced.request, "replaced by a newer tool request");
        }

        self.awaiting = Some(request.clone());
        self.phase = AgentPhase::AwaitingApproval;
        tracing::info!(tool = %request.name, tool_id = %request.id, "awaiting approval");
        self.bus.publish(OrchestrationEvent::ToolRequest { request: request.clone() });
        self.publish_status();

        if let Some(timeout) = self.cfg.approval_timeout {
            let done_tx = self.done_tx.clone();
            let generation = self.generation;
            let tool_id = request.id;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = done_tx.send(Completion::ApprovalExpired { generation, tool_id });
            });
        }
    }

    fn record_denial(&mut self, request: &ToolRequest, reason: &str) {
        self.conversation
            .append_tool_result(request.id.clone(), denial_text(&request.name), true);
        self.bus.publish(OrchestrationEvent::ToolDenied {
            tool_id: request.id.clone(),
            tool_name: request.name.clone(),
            reason: reason.to_string(),
        });
    }

    fn resolve_denied(&mut self, request: ToolRequest, reason: &str) {
        tracing::info!(tool = %request.name, tool_id = %request.id, reason, "tool denied");
        self.awaiting = None;
        self.record_denial(&request, reason);
        self.continue_after_tool();
    }

    /// 一个工具请求已解决：继续排队中的请求，或开始下一轮（轮数耗尽则进入总结轮）
    fn continue_after_tool(&mut self) {
        if !self.queue.is_empty() {
            self.offer_next();
        } else if self.conversation.turns() >= self.cfg.max_turns {
            self.dispatch_round(true);
        } else {
            self.dispatch_round(false);
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(StatusSnapshot {
            phase: self.phase,
            turns: self.conversation.turns(),
            max_turns: self.cfg.max_turns,
            messages: self.conversation.len(),
            pending: self.gate.pending(),
            queued: self.queue.len(),
            completed: self.completed,
        });
    }
}
