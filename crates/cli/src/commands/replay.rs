//! `toolstream replay` — Normalize and accumulate one recorded turn.

use std::path::Path;

use toolstream_agent::{ConversationAccumulator, StreamEventNormalizer};
use toolstream_core::error::BackendError;
use toolstream_core::stream::CanonicalEvent;
use toolstream_providers::ScriptedFixture;
use tracing::info;

pub fn run(fixture: &Path, turn: usize, inline: bool) -> Result<(), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(fixture)
        .map_err(|e| format!("Failed to read fixture {}: {e}", fixture.display()))?;
    let recording: ScriptedFixture = serde_json::from_str(&content)?;

    let recorded = recording.turns.get(turn).ok_or_else(|| {
        format!(
            "Fixture has {} turn(s); there is no turn {turn}",
            recording.turns.len()
        )
    })?;
    if let Some(reason) = &recorded.reject {
        return Err(format!("Turn {turn} is a rejected request: {reason}").into());
    }

    let native_tools = recording.native_tools && !inline;
    let mut normalizer = StreamEventNormalizer::new(native_tools);
    let mut events = Vec::new();
    for delta in recorded.deltas.iter().cloned() {
        events.extend(normalizer.push(delta));
    }
    if let Some(message) = &recorded.interrupt {
        events.extend(normalizer.fail(&BackendError::StreamInterrupted(message.clone())));
    }
    events.extend(normalizer.finish());

    let mut accumulator = ConversationAccumulator::new();
    for event in &events {
        accumulator.apply(event);
    }

    let stop = events.iter().rev().find_map(|e| match e {
        CanonicalEvent::Stop { reason } => Some(reason.as_str()),
        _ => None,
    });
    info!(
        events = events.len(),
        tool_calls = normalizer.resolved_tool_calls().len(),
        native_tools,
        "Replayed turn"
    );

    let report = serde_json::json!({
        "stop": stop,
        "tool_calls": normalizer.resolved_tool_calls(),
        "usage": accumulator.usage(),
        "blocks": accumulator.blocks(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
