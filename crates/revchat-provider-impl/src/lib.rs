pub mod client;
pub mod normalize;
pub mod orchestrator;
pub mod provider;
pub mod upstream;

pub use client::TransportSlot;
pub use orchestrator::{
    BackendAdapter, ByteStream, Connection, OrchestratorConfig, RateLimitDisposition, run_chat,
};
pub use provider::{GrokProvider, XaiProvider, YouProvider};

use std::sync::Arc;

use revchat_provider_core::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    You,
    Xai,
    Grok,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::You => provider::you::BACKEND_NAME,
            BackendKind::Xai => provider::xai::BACKEND_NAME,
            BackendKind::Grok => provider::grok::BACKEND_NAME,
        }
    }

    pub fn model_prefix(&self) -> &'static str {
        match self {
            BackendKind::You => provider::you::MODEL_PREFIX,
            BackendKind::Xai => provider::xai::MODEL_PREFIX,
            BackendKind::Grok => provider::grok::MODEL_PREFIX,
        }
    }

    /// Route a prefixed model id (`You.com:...`, `X.ai:...`, `Grok.com:...`)
    /// to its back-end.
    pub fn for_model(model: &str) -> Option<Self> {
        [BackendKind::You, BackendKind::Xai, BackendKind::Grok]
            .into_iter()
            .find(|kind| model.starts_with(kind.model_prefix()))
    }
}

/// Everything a request handler needs: one pool-backed provider per
/// configured back-end, constructed once at startup and passed by handle.
#[derive(Default)]
pub struct GatewayContext {
    providers: Vec<(BackendKind, Arc<dyn Provider>)>,
}

impl GatewayContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: BackendKind, provider: Arc<dyn Provider>) {
        self.providers.push((kind, provider));
    }

    pub fn provider_for_model(&self, model: &str) -> Option<Arc<dyn Provider>> {
        let kind = BackendKind::for_model(model)?;
        self.providers
            .iter()
            .find(|(registered, _)| *registered == kind)
            .map(|(_, provider)| provider.clone())
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter().map(|(_, provider)| provider)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_prefixes_route_to_backends() {
        assert_eq!(
            BackendKind::for_model("You.com:claude_3_5_sonnet"),
            Some(BackendKind::You)
        );
        assert_eq!(
            BackendKind::for_model("X.ai:grok-3:dialog"),
            Some(BackendKind::Xai)
        );
        assert_eq!(
            BackendKind::for_model("Grok.com:grok-3"),
            Some(BackendKind::Grok)
        );
        assert_eq!(BackendKind::for_model("gpt-4"), None);
    }
}
