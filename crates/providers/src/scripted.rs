//! Scripted backend — replays recorded raw-delta turns.
//!
//! Each call to `stream_complete` consumes the next scripted turn. Used for
//! fixture replay from the CLI and as the model stand-in in tests. Requests
//! are recorded so callers can inspect exactly what history the driver sent.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use toolstream_core::backend::{BackendRequest, DeltaReceiver, ModelBackend, ModelRef, RawDelta};
use toolstream_core::error::BackendError;
use tracing::debug;

/// One recorded model turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedTurn {
    /// Deltas to stream, in order
    #[serde(default)]
    pub deltas: Vec<RawDelta>,

    /// Refuse the request with a transport error instead of streaming
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject: Option<String>,

    /// Break the stream with this error after the deltas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<String>,
}

impl ScriptedTurn {
    pub fn new(deltas: Vec<RawDelta>) -> Self {
        Self {
            deltas,
            ..Self::default()
        }
    }

    /// A turn whose request fails before any delta is produced.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            reject: Some(message.into()),
            ..Self::default()
        }
    }
}

/// On-disk fixture format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedFixture {
    #[serde(default = "default_native_tools")]
    pub native_tools: bool,
    pub turns: Vec<ScriptedTurn>,
}

fn default_native_tools() -> bool {
    true
}

/// A backend that plays back scripted turns.
pub struct ScriptedBackend {
    name: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    /// Replay the final turn forever once the script runs out
    repeat_last: bool,
    last: Mutex<Option<ScriptedTurn>>,
    native_tools: bool,
    delay: Option<Duration>,
    requests: Mutex<Vec<BackendRequest>>,
}

impl ScriptedBackend {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            name: "scripted".into(),
            turns: Mutex::new(turns.into()),
            repeat_last: false,
            last: Mutex::new(None),
            native_tools: true,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: one turn per delta list.
    pub fn from_deltas(turns: Vec<Vec<RawDelta>>) -> Self {
        Self::new(turns.into_iter().map(ScriptedTurn::new).collect())
    }

    /// Load a fixture file.
    pub fn from_fixture_file(path: &Path) -> toolstream_core::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            toolstream_core::Error::Internal(format!("cannot read fixture {}: {e}", path.display()))
        })?;
        let fixture: ScriptedFixture = serde_json::from_str(&content)?;
        Ok(Self::new(fixture.turns).with_native_tools(fixture.native_tools))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Keep replaying the final turn after the script is exhausted.
    pub fn repeating_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn with_native_tools(mut self, enabled: bool) -> Self {
        self.native_tools = enabled;
        self
    }

    /// Sleep between deltas, to simulate a slow model.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `stream_complete` calls so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        let popped = self.turns.lock().ok()?.pop_front();
        let mut last = self.last.lock().ok()?;
        match popped {
            Some(turn) => {
                *last = Some(turn.clone());
                Some(turn)
            }
            None if self.repeat_last => last.clone(),
            None => None,
        }
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_native_tools(&self, _model: &ModelRef) -> bool {
        self.native_tools
    }

    async fn stream_complete(
        &self,
        request: BackendRequest,
    ) -> Result<DeltaReceiver, BackendError> {
        let model = request.model.clone();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let turn = self.next_turn().ok_or_else(|| {
            BackendError::NotConfigured(format!("script for '{}' is exhausted", self.name))
        })?;

        if let Some(message) = turn.reject {
            return Err(BackendError::Transport(message));
        }

        debug!(backend = %self.name, model = %model, deltas = turn.deltas.len(), "Replaying scripted turn");

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let delay = self.delay;

        tokio::spawn(async move {
            for delta in turn.deltas {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(delta)).await.is_err() {
                    return; // receiver dropped
                }
            }
            if let Some(message) = turn.interrupt {
                let _ = tx.send(Err(BackendError::StreamInterrupted(message))).await;
            }
        });

        Ok(rx)
    }
}
