use async_trait::async_trait;
use serde_json::Value;

use revchat_protocol::openai::ModelInfo;

use crate::credential::{Credential, Quota};
use crate::error::GatewayError;
use crate::event::EventStream;
use crate::request::ChatRequest;

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub trace_id: String,
}

impl CallContext {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }
}

/// Result of a cheap validity probe. Absent quota fields stay unset; callers
/// treat "no quota" as "unknown, assume available".
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    pub valid: bool,
    pub quota: Option<Quota>,
    pub identity: Option<String>,
    /// Back-end-specific metadata to merge into the credential record.
    pub extra: Option<Value>,
}

impl ProbeOutcome {
    pub fn invalid() -> Self {
        Self::default()
    }
}

/// Establishes or refreshes a credential's validity with one lightweight
/// upstream call. The pool invokes this lazily during acquisition, never
/// while holding its lock.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn probe(&self, credential: &Credential) -> ProbeOutcome;
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Run one chat request end to end. All failures, including pool
    /// exhaustion, arrive as the stream's terminal item.
    fn chat(&self, req: ChatRequest, ctx: CallContext) -> EventStream;

    /// Uncached pass-through to the back-end's model catalog.
    async fn list_models(&self, ctx: CallContext) -> Result<Vec<ModelInfo>, GatewayError>;
}
