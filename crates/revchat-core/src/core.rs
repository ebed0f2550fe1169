use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use revchat_provider_core::Provider;

use crate::handler::{chat_completions, list_models};

/// Routes a prefixed model id to its back-end provider.
pub type ProviderLookup = Arc<dyn Fn(&str) -> Option<Arc<dyn Provider>> + Send + Sync>;

pub struct CoreState {
    pub lookup: ProviderLookup,
    /// Every configured provider, for catalog aggregation.
    pub providers: Vec<Arc<dyn Provider>>,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(lookup: ProviderLookup, providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            state: Arc::new(CoreState { lookup, providers }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/models", get(list_models))
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}
