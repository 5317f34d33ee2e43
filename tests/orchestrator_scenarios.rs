//! 编排器端到端场景：脚本化模型 + 内存工具传输

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use keylime_agent::core::{
    denial_text, spawn_orchestrator, AgentError, AgentPhase, ContentPart, OrchestratorConfig, OrchestratorHandle, Role,
};
use keylime_agent::events::{EventBus, EventStream, OrchestrationEvent};
use keylime_agent::llm::{LlmError, ScriptedModelClient};
use keylime_agent::tools::{CallToolResult, InMemoryTransport, ToolCatalog, ToolDescriptor, ToolExecutor};

struct Harness {
    handle: OrchestratorHandle,
    model: Arc<ScriptedModelClient>,
    transport: Arc<InMemoryTransport>,
    events: EventStream,
}

fn keylime_transport() -> InMemoryTransport {
    InMemoryTransport::new()
        .with_tool(
            ToolDescriptor::new("list_resources", "Lists all registered agents", json!({"type": "object"})),
            |_| Ok(CallToolResult::ok(r#"["d432fbb3","e1b2c3d4"]"#)),
        )
        .with_tool(
            ToolDescriptor::new(
                "Get_agent_status",
                "Status of one agent",
                json!({"type": "object", "properties": {"agent_uuid": {"type": "string"}}, "required": ["agent_uuid"]}),
            ),
            |args| match args["agent_uuid"].as_str() {
                Some("d432fbb3") => Ok(CallToolResult::ok(r#"{"operational_state":"Get Quote"}"#)),
                _ => Ok(CallToolResult::error("agent not found")),
            },
        )
}

fn harness_with(transport: InMemoryTransport, max_turns: usize, approval_timeout: Option<Duration>) -> Harness {
    let transport = Arc::new(transport);
    let descriptors = vec![
        ToolDescriptor::new("list_resources", "Lists all registered agents", json!({"type": "object"})),
        ToolDescriptor::new(
            "Get_agent_status",
            "Status of one agent",
            json!({"type": "object", "properties": {"agent_uuid": {"type": "string"}}, "required": ["agent_uuid"]}),
        ),
    ];
    let catalog = Arc::new(ToolCatalog::from_descriptors(descriptors).unwrap());
    let bus = EventBus::new(256, Duration::from_secs(30));
    let executor = ToolExecutor::new(transport.clone(), catalog, bus.clone(), Duration::from_secs(5));
    let model = Arc::new(ScriptedModelClient::new());
    let cfg = OrchestratorConfig {
        system_prompt: "You manage Keylime.".to_string(),
        summary_prompt: "Please summarize.".to_string(),
        max_turns,
        approval_timeout,
    };
    let handle = spawn_orchestrator(cfg, model.clone(), executor, bus);
    let events = handle.subscribe();
    Harness {
        handle,
        model,
        transport,
        events,
    }
}

fn harness() -> Harness {
    harness_with(keylime_transport(), 5, None)
}

fn tool_use(id: &str, name: &str, input: serde_json::Value) -> ContentPart {
    ContentPart::ToolUse {
        id: id.to_string(),
        name: name.to_string(),
        input,
    }
}

async fn next_event(events: &mut EventStream) -> OrchestrationEvent {
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if !matches!(ev, OrchestrationEvent::Keepalive { .. }) {
            return ev;
        }
    }
}

/// 读取事件直到请求结束（Idle / Failed），返回经过的事件类型
async fn kinds_until_settled(h: &mut Harness, expected: usize) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    for _ in 0..expected {
        kinds.push(next_event(&mut h.events).await.kind());
    }
    let mut status = h.handle.status_receiver();
    tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.phase.is_settled() && s.completed > 0))
        .await
        .expect("request did not settle")
        .expect("orchestrator stopped");
    kinds
}

async fn wait_for_pending(h: &mut Harness) {
    loop {
        if next_event(&mut h.events).await.kind() == "tool-request" {
            return;
        }
    }
}

#[tokio::test]
async fn approve_runs_tool_and_finishes_with_narration() {
    let mut h = harness();
    h.model.push_reply(vec![tool_use("toolu_01", "list_resources", json!({}))]);
    h.model.push_text("Two agents are registered.");

    h.handle.submit("list all resources").unwrap();
    assert_eq!(next_event(&mut h.events).await.kind(), "user-message");
    assert_eq!(next_event(&mut h.events).await.kind(), "tool-request");
    assert_eq!(h.handle.pending().map(|r| r.name), Some("list_resources".to_string()));

    h.handle.approve().unwrap();
    let kinds = kinds_until_settled(&mut h, 3).await;
    assert_eq!(kinds, vec!["tool-executing", "tool-result", "assistant-message"]);

    assert_eq!(h.transport.calls().len(), 1);
    let history = h.handle.history().await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[2].role, Role::User);
    assert!(matches!(
        &history[2].content[0],
        ContentPart::ToolResult { tool_use_id, is_error: false, .. } if tool_use_id == "toolu_01"
    ));

    // 第二轮看到了工具结果
    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 3);
    assert_eq!(requests[1].tool_names.as_deref(), Some(&["list_resources".to_string(), "Get_agent_status".to_string()][..]));
}

#[tokio::test]
async fn deny_feeds_synthetic_result_and_never_executes() {
    let mut h = harness();
    h.model.push_reply(vec![tool_use("toolu_01", "list_resources", json!({}))]);
    h.model.push_text("Understood, I will not list the resources.");

    h.handle.submit("list all resources").unwrap();
    assert_eq!(next_event(&mut h.events).await.kind(), "user-message");
    assert_eq!(next_event(&mut h.events).await.kind(), "tool-request");

    h.handle.deny().unwrap();
    let kinds = kinds_until_settled(&mut h, 2).await;
    assert_eq!(kinds, vec!["tool-denied", "assistant-message"]);
    assert!(h.transport.calls().is_empty());

    let history = h.handle.history().await.unwrap();
    match &history[2].content[0] {
        ContentPart::ToolResult { content, is_error, .. } => {
            assert!(*is_error);
            assert_eq!(content, &denial_text("list_resources"));
        }
        other => panic!("expected tool result, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_tool_is_a_flagged_failure() {
    let mut h = harness();
    h.model.push_reply(vec![tool_use("toolu_01", "Delete_all_agents", json!({}))]);
    h.model.push_text("That tool does not exist.");

    h.handle.submit("wipe everything").unwrap();
    wait_for_pending(&mut h).await;
    h.handle.approve().unwrap();

    let kinds = kinds_until_settled(&mut h, 4).await;
    assert_eq!(kinds, vec!["tool-executing", "error", "tool-result", "assistant-message"]);
    assert!(h.transport.calls().is_empty());

    let history = h.handle.history().await.unwrap();
    assert!(matches!(&history[2].content[0], ContentPart::ToolResult { is_error: true, .. }));
    assert_eq!(h.handle.status().phase, AgentPhase::Idle);
}

#[tokio::test]
async fn multiple_tool_uses_are_resolved_in_order_and_batched() {
    let mut h = harness();
    h.model.push_reply(vec![
        ContentPart::text("Checking each agent."),
        tool_use("t1", "Get_agent_status", json!({"agent_uuid": "d432fbb3"})),
        tool_use("t2", "Get_agent_status", json!({"agent_uuid": "missing"})),
        tool_use("t3", "list_resources", json!({})),
    ]);
    h.model.push_text("One agent is healthy, one is unknown.");

    h.handle.submit("check agents").unwrap();
    assert_eq!(next_event(&mut h.events).await.kind(), "user-message");
    assert_eq!(next_event(&mut h.events).await.kind(), "assistant-message");

    // 一次只有一个待审批请求
    for (expected, approve) in [("t1", true), ("t2", true), ("t3", false)] {
        loop {
            if let OrchestrationEvent::ToolRequest { request } = next_event(&mut h.events).await {
                assert_eq!(request.id, expected);
                break;
            }
        }
        assert_eq!(h.handle.pending().map(|r| r.id), Some(expected.to_string()));
        if approve {
            h.handle.approve().unwrap();
        } else {
            h.handle.deny().unwrap();
        }
    }

    let mut status = h.handle.status_receiver();
    tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.completed > 0))
        .await
        .unwrap()
        .unwrap();

    let history = h.handle.history().await.unwrap();
    assert_eq!(history.len(), 4);
    let results: Vec<(String, bool)> = history[2]
        .content
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolResult { tool_use_id, is_error, .. } => Some((tool_use_id.clone(), *is_error)),
            _ => None,
        })
        .collect();
    assert_eq!(
        results,
        vec![("t1".to_string(), false), ("t2".to_string(), true), ("t3".to_string(), true)]
    );
    assert_eq!(h.transport.calls().len(), 2);
    // 三个工具都解决之后才发起第二轮
    assert_eq!(h.model.requests().len(), 2);
}

#[tokio::test]
async fn turn_budget_forces_summary_without_tools() {
    let mut h = harness_with(keylime_transport(), 2, None);
    h.model.push_reply(vec![tool_use("t1", "list_resources", json!({}))]);
    h.model.push_reply(vec![tool_use("t2", "list_resources", json!({}))]);
    h.model.push_reply(vec![
        ContentPart::text("Summary: listed agents twice."),
        tool_use("t3", "list_resources", json!({})),
    ]);

    h.handle.submit("keep listing").unwrap();
    for _ in 0..2 {
        wait_for_pending(&mut h).await;
        h.handle.approve().unwrap();
    }

    let mut status = h.handle.status_receiver();
    tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.completed > 0))
        .await
        .unwrap()
        .unwrap();

    let requests = h.model.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].tool_names.is_some());
    assert!(requests[1].tool_names.is_some());
    assert!(requests[2].tool_names.is_none());
    let last_user = requests[2].messages.last().unwrap();
    assert!(last_user
        .content
        .iter()
        .any(|p| matches!(p, ContentPart::Text { text } if text == "Please summarize.")));

    // 总结轮里的工具请求被忽略
    assert!(h.handle.pending().is_none());
    assert_eq!(h.handle.status().phase, AgentPhase::Idle);
    assert_eq!(h.handle.status().turns, 2);
    let history = h.handle.history().await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, vec![ContentPart::text("Summary: listed agents twice.")]);
}

#[tokio::test]
async fn reset_clears_state_and_drops_in_flight_results() {
    let transport = keylime_transport().with_delay(Duration::from_millis(200));
    let mut h = harness_with(transport, 5, None);
    h.model.push_reply(vec![tool_use("t1", "list_resources", json!({}))]);

    h.handle.submit("list all resources").unwrap();
    wait_for_pending(&mut h).await;
    h.handle.approve().unwrap();
    assert_eq!(next_event(&mut h.events).await.kind(), "tool-executing");

    h.handle.reset().unwrap();
    assert_eq!(next_event(&mut h.events).await.kind(), "reset");

    // 旧的工具结果在 reset 之后到达：既不写回历史，也不推送给观察者
    let late = tokio::time::timeout(Duration::from_millis(350), h.events.recv()).await;
    assert!(late.is_err(), "unexpected event after reset: {:?}", late);
    assert_eq!(h.transport.calls().len(), 1);
    assert!(h.handle.history().await.unwrap().is_empty());
    let status = h.handle.status();
    assert_eq!(status.phase, AgentPhase::Idle);
    assert_eq!(status.turns, 0);
    assert!(status.pending.is_none());
    assert_eq!(h.model.requests().len(), 1);

    // 过期的批准是无害的空操作
    assert!(matches!(h.handle.approve(), Err(AgentError::ApprovalNotFound)));
}

#[tokio::test]
async fn reset_while_awaiting_approval() {
    let mut h = harness();
    h.model.push_reply(vec![tool_use("t1", "list_resources", json!({}))]);
    h.handle.submit("list all resources").unwrap();
    wait_for_pending(&mut h).await;

    h.handle.reset().unwrap();
    assert!(h.handle.pending().is_none());
    assert!(matches!(h.handle.deny(), Err(AgentError::ApprovalNotFound)));
    assert_eq!(next_event(&mut h.events).await.kind(), "reset");
    assert!(h.handle.history().await.unwrap().is_empty());
}

#[tokio::test]
async fn model_failure_reports_error_and_keeps_history() {
    let mut h = harness();
    h.model.push_error(LlmError::Api {
        status: 529,
        message: "overloaded".to_string(),
    });
    h.model.push_text("Back online.");

    h.handle.submit("list all resources").unwrap();
    let kinds = kinds_until_settled(&mut h, 2).await;
    assert_eq!(kinds, vec!["user-message", "error"]);
    assert_eq!(h.handle.status().phase, AgentPhase::Failed);
    let history = h.handle.history().await.unwrap();
    assert_eq!(history.len(), 1);

    // 下一条消息在原历史上重新开始，user 轮合并而不是重复
    h.handle.submit("try again").unwrap();
    assert_eq!(next_event(&mut h.events).await.kind(), "user-message");
    assert_eq!(next_event(&mut h.events).await.kind(), "assistant-message");
    let history = h.handle.history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content.len(), 2);
}

#[tokio::test]
async fn new_message_while_awaiting_approval_denies_outstanding_tools() {
    let mut h = harness();
    h.model.push_reply(vec![
        tool_use("t1", "list_resources", json!({})),
        tool_use("t2", "Get_agent_status", json!({"agent_uuid": "d432fbb3"})),
    ]);
    h.model.push_text("Sure, never mind.");

    h.handle.submit("list all resources").unwrap();
    wait_for_pending(&mut h).await;

    h.handle.submit("actually, forget it").unwrap();
    let kinds = kinds_until_settled(&mut h, 4).await;
    assert_eq!(kinds, vec!["tool-denied", "tool-denied", "user-message", "assistant-message"]);

    let history = h.handle.history().await.unwrap();
    // 两个 tool_result 与新的用户文本在同一个 user 轮
    assert_eq!(history[2].content.len(), 3);
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn approve_after_new_message_finds_nothing_pending() {
    let mut h = harness();
    h.model.push_reply(vec![tool_use("t1", "list_resources", json!({}))]);
    h.model.push_text("Sure, something else then.");

    h.handle.submit("list all resources").unwrap();
    wait_for_pending(&mut h).await;

    h.handle.submit("something else").unwrap();
    assert!(matches!(h.handle.approve(), Err(AgentError::ApprovalNotFound)));

    let kinds = kinds_until_settled(&mut h, 3).await;
    assert_eq!(kinds, vec!["tool-denied", "user-message", "assistant-message"]);
    assert!(h.transport.calls().is_empty());

    let history = h.handle.history().await.unwrap();
    assert!(matches!(
        &history[2].content[0],
        ContentPart::ToolResult { tool_use_id, is_error: true, .. } if tool_use_id == "t1"
    ));
}

#[tokio::test]
async fn approval_timeout_auto_denies() {
    let mut h = harness_with(keylime_transport(), 5, Some(Duration::from_millis(50)));
    h.model.push_reply(vec![tool_use("t1", "list_resources", json!({}))]);
    h.model.push_text("No decision was made, so I did not list anything.");

    h.handle.submit("list all resources").unwrap();
    wait_for_pending(&mut h).await;

    match next_event(&mut h.events).await {
        OrchestrationEvent::ToolDenied { tool_id, reason, .. } => {
            assert_eq!(tool_id, "t1");
            assert!(reason.contains("timed out"));
        }
        other => panic!("expected tool-denied, got {:?}", other),
    }
    assert_eq!(next_event(&mut h.events).await.kind(), "assistant-message");
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn submit_while_model_is_busy_is_rejected() {
    let mut h = harness_with(keylime_transport().with_delay(Duration::from_millis(100)), 5, None);
    h.model.push_reply(vec![tool_use("t1", "list_resources", json!({}))]);
    h.model.push_text("Two agents are registered.");
    h.handle.submit("list all resources").unwrap();
    wait_for_pending(&mut h).await;
    h.handle.approve().unwrap();
    // 工具执行期间
    h.handle.submit("hello?").unwrap();

    let mut saw_busy_error = false;
    for _ in 0..3 {
        if let OrchestrationEvent::Error { text } = next_event(&mut h.events).await {
            saw_busy_error |= text.contains("please wait");
        }
    }
    assert!(saw_busy_error);
    assert!(matches!(h.handle.submit("   "), Err(AgentError::EmptyMessage)));
}
