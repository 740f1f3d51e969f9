//! End-to-end tests for the toolstream orchestrator.
//!
//! These drive the bundled fixtures through the same pieces `toolstream run`
//! wires together: scripted backend behind the router, a tool registry,
//! the broadcast bridge and the session registry.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use toolstream_agent::{
    ConversationAccumulator, DriverContext, SessionEvent, SessionRequest, StreamSessionRegistry,
    normalize_all,
};
use toolstream_config::OrchestratorConfig;
use toolstream_core::backend::ModelBackend;
use toolstream_core::block::{BlockKind, BlockStatus};
use toolstream_core::bridge::{BridgeNotification, BroadcastBridge};
use toolstream_core::error::ToolError;
use toolstream_core::message::{Conversation, Message, Role, SessionId};
use toolstream_core::session::{DoneReason, SessionSummary};
use toolstream_core::stream::{CanonicalEvent, StopReason};
use toolstream_core::tool::{Tool, ToolOutput, ToolRegistry, ToolServer};
use toolstream_providers::{BackendRouter, ScriptedBackend, ScriptedFixture};

// ── Fixtures and wiring ─────────────────────────────────────────────────

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(name)
}

struct Echo;

#[async_trait]
impl Tool for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text(arguments["text"].as_str().unwrap_or_default()))
    }
}

struct Run {
    events: Vec<SessionEvent>,
    summary: SessionSummary,
    backend: Arc<ScriptedBackend>,
}

async fn run_fixture(name: &str, config: OrchestratorConfig, inline: bool) -> Run {
    let mut backend = ScriptedBackend::from_fixture_file(&fixture(name)).unwrap();
    if inline {
        backend = backend.with_native_tools(false);
    }
    let backend = Arc::new(backend);
    let model = config.model_ref().unwrap();
    let router = BackendRouter::new()
        .with(model.provider.clone(), backend.clone())
        .with_default(model.provider.clone());

    let mut tools = ToolRegistry::new();
    tools.register(Box::new(Echo));
    let catalog = tools.catalog(&ToolServer::new("builtin", "Built-in tools"));

    let bridge = Arc::new(BroadcastBridge::default());
    let mut notifications = bridge.subscribe();

    let ctx = DriverContext {
        backend: Arc::new(router),
        executor: Arc::new(tools),
        bridge: bridge.clone(),
        max_tool_calls: config.max_tool_calls_per_session,
        native_tool_calling: config.native_tool_calling,
    };
    let registry = StreamSessionRegistry::new(ctx, &config);

    let session_id = SessionId::new();
    let request = SessionRequest::new(
        session_id.clone(),
        Conversation::from_messages(vec![Message::user("Echo something")]),
        model,
    )
    .with_catalog(catalog);

    let events: Vec<_> = registry.try_start(request).unwrap().collect().await;
    assert!(!registry.is_active(&session_id));

    Run {
        events,
        summary: session_summary(&mut notifications),
        backend,
    }
}

fn session_summary(rx: &mut broadcast::Receiver<Arc<BridgeNotification>>) -> SessionSummary {
    loop {
        match rx.try_recv() {
            Ok(n) => {
                if let BridgeNotification::SessionEnd { summary, .. } = n.as_ref() {
                    return (**summary).clone();
                }
            }
            Err(e) => panic!("no session summary on the bridge: {e}"),
        }
    }
}

fn end_reason(events: &[SessionEvent]) -> DoneReason {
    match events.last() {
        Some(SessionEvent::End { reason, .. }) => *reason,
        other => panic!("expected end event last, got {other:?}"),
    }
}

// ── E2E: Native tool calling ────────────────────────────────────────────

#[tokio::test]
async fn e2e_native_fixture_calls_tool_then_answers() {
    let run = run_fixture("echo.json", OrchestratorConfig::default(), false).await;

    assert_eq!(end_reason(&run.events), DoneReason::Natural);
    assert!(!run.events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));
    assert_eq!(run.backend.calls(), 2);

    let summary = run.summary;
    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.tool_call_count, 1);
    assert_eq!(summary.usage.total_tokens, 73);

    let kinds: Vec<_> = summary.blocks.iter().map(|b| b.block_type()).collect();
    assert_eq!(kinds, vec!["reasoning", "content", "tool_call", "content"]);
    assert!(summary.blocks.iter().all(|b| b.status == BlockStatus::Success));

    let call = summary.blocks[2].as_tool_call().unwrap();
    assert_eq!(call.name, "echo");
    assert_eq!(call.arguments, r#"{"text":"hello"}"#);
    assert_eq!(call.server.as_ref().unwrap().id, "builtin");
    assert_eq!(call.response.as_ref().unwrap().to_text(), "hello");

    let roles: Vec<_> = summary.history.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(summary.history.messages[1].tool_calls.len(), 1);
    assert_eq!(summary.history.messages[2].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(summary.history.messages[3].content, "The tool said: hello");
}

#[tokio::test]
async fn e2e_tool_ceiling_from_config_bounds_session() {
    let config = OrchestratorConfig {
        max_tool_calls_per_session: 1,
        ..OrchestratorConfig::default()
    };
    let run = run_fixture("echo.json", config, false).await;

    assert_eq!(end_reason(&run.events), DoneReason::Bounded);
    assert_eq!(run.backend.calls(), 1);
    assert_eq!(run.summary.tool_call_count, 1);

    match &run.summary.blocks.last().unwrap().kind {
        BlockKind::Action { content } => assert_eq!(content, "Maximum tool calls reached"),
        other => panic!("expected the ceiling marker, got {other:?}"),
    }
}

// ── E2E: Inline tool calling ────────────────────────────────────────────

#[tokio::test]
async fn e2e_inline_fixture_round_trips_tool_response_through_history() {
    let run = run_fixture("inline_echo.json", OrchestratorConfig::default(), true).await;

    assert_eq!(end_reason(&run.events), DoneReason::Natural);
    assert_eq!(run.summary.tool_call_count, 1);

    let requests = run.backend.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].native_tools);
    assert_eq!(requests[0].messages[0].role, Role::System);
    assert!(requests[0].messages[0].content.contains("<tool_call>"));

    let last = requests[1].messages.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert!(last.content.contains("inline"));

    // Instructions live on the request copy only.
    assert!(run.summary.history.messages.iter().all(|m| m.role != Role::System));
}

// ── E2E: Backend failure ────────────────────────────────────────────────

#[tokio::test]
async fn e2e_interrupted_fixture_ends_with_single_error() {
    let run = run_fixture("interrupted.json", OrchestratorConfig::default(), false).await;

    let errors = run
        .events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(end_reason(&run.events), DoneReason::Error);
    assert!(run.events.iter().any(|e| matches!(
        e,
        SessionEvent::Response(CanonicalEvent::Stop { reason: StopReason::Error })
    )));
    assert!(
        run.summary
            .blocks
            .iter()
            .any(|b| matches!(b.kind, BlockKind::Error { .. }))
    );
}

// ── E2E: Replay (normalizer + accumulator only) ─────────────────────────

#[test]
fn e2e_replay_first_turn_of_native_fixture() {
    let text = std::fs::read_to_string(fixture("echo.json")).unwrap();
    let recording: ScriptedFixture = serde_json::from_str(&text).unwrap();

    let (events, calls) = normalize_all(recording.turns[0].deltas.clone(), recording.native_tools);
    assert!(matches!(
        events.last(),
        Some(CanonicalEvent::Stop { reason: StopReason::ToolUse })
    ));
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].arguments, r#"{"text":"hello"}"#);

    let mut acc = ConversationAccumulator::new();
    for event in &events {
        acc.apply(event);
    }
    assert_eq!(acc.usage().total_tokens, 28);
    assert!(acc.blocks()[2].is_loading());
}

#[test]
fn e2e_replay_inline_fixture_finds_tool_call_in_text() {
    let text = std::fs::read_to_string(fixture("inline_echo.json")).unwrap();
    let recording: ScriptedFixture = serde_json::from_str(&text).unwrap();

    let (_, calls) = normalize_all(recording.turns[0].deltas.clone(), false);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "echo");
    assert!(calls[0].id.starts_with("call_"));

    let scripted = ScriptedBackend::from_fixture_file(&fixture("inline_echo.json")).unwrap();
    assert!(!scripted.supports_native_tools(&OrchestratorConfig::default().model_ref().unwrap()));
}
