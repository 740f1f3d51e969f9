//! `toolstream run` — Run one session against a recorded fixture.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio_stream::StreamExt;
use toolstream_agent::{DriverContext, SessionEvent, SessionRequest, StreamSessionRegistry};
use toolstream_config::OrchestratorConfig;
use toolstream_core::bridge::{BridgeNotification, BroadcastBridge};
use toolstream_core::message::{Conversation, Message, SessionId};
use toolstream_core::session::DoneReason;
use toolstream_core::tool::ToolServer;
use toolstream_providers::{BackendRouter, ScriptedBackend};
use tracing::{debug, info, warn};

use super::tools;

pub async fn run(
    mut config: OrchestratorConfig,
    fixture: &Path,
    message: String,
    inline: bool,
    max_tool_calls: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(limit) = max_tool_calls {
        config.max_tool_calls_per_session = limit;
        config.validate()?;
    }
    let model = config.model_ref()?;

    let mut backend = ScriptedBackend::from_fixture_file(fixture)?;
    if inline {
        backend = backend.with_native_tools(false);
    }
    let router = BackendRouter::new()
        .with(model.provider.clone(), Arc::new(backend))
        .with_default(model.provider.clone());

    let registry_tools = Arc::new(tools::builtin_registry());
    let catalog = registry_tools.catalog(&ToolServer::new("builtin", "Built-in tools"));

    let bridge = Arc::new(BroadcastBridge::default());
    let watcher = tokio::spawn(log_notifications(bridge.subscribe()));

    let ctx = DriverContext {
        backend: Arc::new(router),
        executor: registry_tools,
        bridge: bridge.clone(),
        max_tool_calls: config.max_tool_calls_per_session,
        native_tool_calling: config.native_tool_calling,
    };
    let registry = StreamSessionRegistry::new(ctx, &config);

    let session_id = SessionId::new();
    let request = SessionRequest::new(
        session_id.clone(),
        Conversation::from_messages(vec![Message::user(message)]),
        model,
    )
    .with_catalog(catalog);

    let mut stream = registry.try_start(request)?;
    let mut outcome = None;

    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                if let SessionEvent::End { reason, .. } = &event {
                    outcome = Some(*reason);
                }
                println!("{}", serde_json::to_string(&event)?);
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(session_id = %session_id, "Interrupted, cancelling session");
                registry.cancel(&session_id);
            }
        }
    }

    // Dropping the last bridge handles closes the watcher's channel.
    drop(registry);
    drop(bridge);
    let _ = watcher.await;

    match outcome {
        Some(DoneReason::Error) => Err("Session ended with an error".into()),
        Some(_) => Ok(()),
        None => Err("Session stream closed without an end event".into()),
    }
}

async fn log_notifications(mut rx: tokio::sync::broadcast::Receiver<Arc<BridgeNotification>>) {
    loop {
        match rx.recv().await {
            Ok(notification) => match notification.as_ref() {
                BridgeNotification::Blocks { session_id, blocks } => {
                    debug!(session_id = %session_id, blocks = blocks.len(), "Blocks changed");
                }
                BridgeNotification::SessionEnd { session_id, summary } => {
                    info!(
                        session_id = %session_id,
                        reason = ?summary.reason,
                        iterations = summary.iterations,
                        tool_calls = summary.tool_call_count,
                        total_tokens = summary.usage.total_tokens,
                        first_token_ms = ?summary.metrics.first_token_ms,
                        total_ms = summary.metrics.total_ms,
                        "Session summary"
                    );
                }
                BridgeNotification::Event { .. } => {}
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Bridge watcher lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
