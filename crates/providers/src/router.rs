//! Backend router — dispatches a request to a backend by the provider part
//! of its model reference.
//!
//! The router is itself a [`ModelBackend`], so the orchestrator keeps seeing
//! a single backend no matter how many vendors are configured.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use toolstream_core::backend::{BackendRequest, DeltaReceiver, ModelBackend, ModelRef};
use toolstream_core::error::BackendError;
use tracing::debug;

/// Routes streaming requests to the correct backend.
pub struct BackendRouter {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
    default_backend: Option<String>,
}

impl BackendRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_backend: None,
        }
    }

    /// Register a backend under a provider name.
    pub fn register(&mut self, provider: impl Into<String>, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(provider.into(), backend);
    }

    /// Builder form of [`BackendRouter::register`].
    pub fn with(mut self, provider: impl Into<String>, backend: Arc<dyn ModelBackend>) -> Self {
        self.register(provider, backend);
        self
    }

    /// Use `provider` for model references naming an unknown provider.
    pub fn with_default(mut self, provider: impl Into<String>) -> Self {
        self.default_backend = Some(provider.into());
        self
    }

    /// Resolve the backend serving `model`.
    pub fn resolve(&self, model: &ModelRef) -> Option<&Arc<dyn ModelBackend>> {
        self.backends.get(&model.provider).or_else(|| {
            self.default_backend
                .as_ref()
                .and_then(|name| self.backends.get(name))
        })
    }

    /// List all registered provider names.
    pub fn list(&self) -> Vec<&str> {
        self.backends.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for BackendRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelBackend for BackendRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn supports_native_tools(&self, model: &ModelRef) -> bool {
        self.resolve(model)
            .map(|b| b.supports_native_tools(model))
            .unwrap_or(true)
    }

    async fn stream_complete(
        &self,
        request: BackendRequest,
    ) -> Result<DeltaReceiver, BackendError> {
        let backend = self.resolve(&request.model).ok_or_else(|| {
            BackendError::NotConfigured(format!("no backend for provider '{}'", request.model.provider))
        })?;
        debug!(backend = %backend.name(), model = %request.model, "Routing stream request");
        backend.stream_complete(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedBackend;
    use toolstream_core::backend::RawDelta;

    fn request(model: ModelRef) -> BackendRequest {
        BackendRequest {
            model,
            messages: vec![],
            tools: vec![],
            native_tools: true,
        }
    }

    #[tokio::test]
    async fn routes_by_provider() {
        let a = Arc::new(ScriptedBackend::from_deltas(vec![vec![RawDelta::Text { text: "a".into() }]]));
        let b = Arc::new(
            ScriptedBackend::from_deltas(vec![vec![RawDelta::Text { text: "b".into() }]])
                .with_native_tools(false),
        );
        let router = BackendRouter::new().with("alpha", a.clone()).with("beta", b.clone());

        let mut rx = router.stream_complete(request(ModelRef::new("beta", "m"))).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Ok(RawDelta::Text { text })) if text == "b"));
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 1);
        assert!(!router.supports_native_tools(&ModelRef::new("beta", "m")));
    }

    #[tokio::test]
    async fn unknown_provider_without_default_fails() {
        let router = BackendRouter::new();
        let err = router
            .stream_complete(request(ModelRef::new("nope", "m")))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotConfigured(_)));
    }

    #[test]
    fn falls_back_to_default() {
        let router = BackendRouter::new()
            .with("scripted", Arc::new(ScriptedBackend::new(vec![])))
            .with_default("scripted");
        assert!(router.resolve(&ModelRef::new("other", "m")).is_some());
        assert_eq!(router.list(), vec!["scripted"]);
    }
}
