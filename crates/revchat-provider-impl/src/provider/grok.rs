use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use revchat_protocol::openai::{ChatMessage, ModelInfo};
use revchat_protocol::{BracedFrameDecoder, FrameDecoder};
use revchat_provider_core::{
    AttemptFailure, CallContext, ChatRequest, Credential, CredentialPool, CredentialValidator,
    EventStream, GatewayError, ProbeOutcome, Provider, Quota,
};

use crate::client::TransportSlot;
use crate::normalize::{EventNormalizer, GrokNormalizer};
use crate::orchestrator::{BackendAdapter, Connection, OrchestratorConfig, run_chat};
use crate::provider::{cookie_headers, credential_cookie, missing_secret, strip_model_prefix};
use crate::upstream::{network_failure, open_stream};

pub const BACKEND_NAME: &str = "grok";
pub const MODEL_PREFIX: &str = "Grok.com:";
const BASE_URL: &str = "https://grok.com";

pub struct GrokProvider {
    pool: Arc<CredentialPool>,
    adapter: Arc<GrokAdapter>,
    orchestrator: OrchestratorConfig,
}

impl GrokProvider {
    pub fn new(
        pool: CredentialPool,
        transport: Arc<TransportSlot>,
        orchestrator: OrchestratorConfig,
    ) -> Self {
        Self {
            pool: Arc::new(pool),
            adapter: Arc::new(GrokAdapter { transport }),
            orchestrator,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }
}

#[async_trait]
impl Provider for GrokProvider {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn chat(&self, req: ChatRequest, ctx: CallContext) -> EventStream {
        run_chat(
            self.pool.clone(),
            self.adapter.clone(),
            self.adapter.clone(),
            self.orchestrator,
            req,
            ctx,
        )
    }

    async fn list_models(&self, ctx: CallContext) -> Result<Vec<ModelInfo>, GatewayError> {
        let credential = self
            .pool
            .acquire(&[])
            .map_err(|err| GatewayError::NoCredentials(err.to_string()))?;
        let cookie = credential_cookie(&credential.secret)
            .ok_or_else(|| GatewayError::CredentialInvalid("missing cookie".to_string()))?;
        let headers = cookie_headers(&cookie).map_err(|failure| failure.error)?;

        let response = self
            .adapter
            .transport
            .client()
            .post(format!("{BASE_URL}/rest/models"))
            .headers(headers)
            .send()
            .await
            .map_err(|err| GatewayError::Connection(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            warn!(
                event = "models_list_failed",
                trace_id = %ctx.trace_id,
                backend = BACKEND_NAME,
                status = status.as_u16()
            );
            return Err(GatewayError::Connection(format!(
                "model catalog returned {}",
                status.as_u16()
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| GatewayError::Protocol(err.to_string()))?;

        let models = payload["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|model| model.get("modelId").and_then(Value::as_str))
                    .map(|id| ModelInfo::new(format!("{MODEL_PREFIX}{id}"), "xAI"))
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

struct GrokAdapter {
    transport: Arc<TransportSlot>,
}

/// The upstream endpoint takes one message, so the history collapses into a
/// single prompt separated by blank lines.
fn combined_message(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn chat_body(model: &str, message: &str) -> Value {
    json!({
        "temporary": false,
        "modelName": model,
        "message": message,
        "fileAttachments": [],
        "imageAttachments": [],
        "disableSearch": false,
        "enableImageGeneration": true,
        "returnImageBytes": false,
        "returnRawGrokInXaiRequest": false,
        "enableImageStreaming": true,
        "imageGenerationCount": 2,
        "forceConcise": false,
        "toolOverrides": {},
        "enableSideBySide": true,
        "isPreset": false,
        "sendFinalMetadata": true,
        "customInstructions": "",
        "deepsearchPreset": "",
        "isReasoning": false
    })
}

#[async_trait]
impl BackendAdapter for GrokAdapter {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn connect(
        &self,
        credential: &Credential,
        req: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<Connection, AttemptFailure> {
        let cookie =
            credential_cookie(&credential.secret).ok_or_else(|| missing_secret("cookie"))?;
        let headers = cookie_headers(&cookie)?;
        let model = strip_model_prefix(&req.model, MODEL_PREFIX);
        let body = chat_body(model, &combined_message(&req.messages));

        let started_at = Instant::now();
        info!(
            event = "upstream_request",
            trace_id = %ctx.trace_id,
            backend = BACKEND_NAME,
            op = "chat",
            model = %model,
            credential_id = credential.id
        );
        let response = self
            .transport
            .client()
            .post(format!("{BASE_URL}/rest/app-chat/conversations/new"))
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                warn!(
                    event = "upstream_response",
                    trace_id = %ctx.trace_id,
                    backend = BACKEND_NAME,
                    op = "chat",
                    status = "error",
                    elapsed_ms = started_at.elapsed().as_millis(),
                    error = %err
                );
                network_failure(err)
            })?;
        info!(
            event = "upstream_response",
            trace_id = %ctx.trace_id,
            backend = BACKEND_NAME,
            op = "chat",
            status = response.status().as_u16(),
            elapsed_ms = started_at.elapsed().as_millis()
        );
        Ok(Connection::new(open_stream(response).await?))
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(BracedFrameDecoder::new())
    }

    fn normalizer(&self) -> Box<dyn EventNormalizer> {
        Box::new(GrokNormalizer::new())
    }

    fn reset_transport(&self) -> Result<(), GatewayError> {
        self.transport.reset()
    }
}

#[async_trait]
impl CredentialValidator for GrokAdapter {
    /// Probe via the rate-limit endpoint: cheapest call that both proves the
    /// session and reports the remaining quota window.
    async fn probe(&self, credential: &Credential) -> ProbeOutcome {
        let Some(cookie) = credential_cookie(&credential.secret) else {
            return ProbeOutcome::invalid();
        };
        let Ok(headers) = cookie_headers(&cookie) else {
            return ProbeOutcome::invalid();
        };

        let response = self
            .transport
            .client()
            .post(format!("{BASE_URL}/rest/rate-limits"))
            .headers(headers)
            .json(&json!({"requestKind": "DEFAULT", "modelName": "grok-3"}))
            .send()
            .await;
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(
                    event = "probe_failed",
                    backend = BACKEND_NAME,
                    credential_id = credential.id,
                    status = response.status().as_u16()
                );
                return ProbeOutcome::invalid();
            }
            Err(err) => {
                warn!(
                    event = "probe_failed",
                    backend = BACKEND_NAME,
                    credential_id = credential.id,
                    error = %err
                );
                return ProbeOutcome::invalid();
            }
        };

        let Ok(payload) = response.json::<Value>().await else {
            return ProbeOutcome::invalid();
        };
        let quota = match (
            payload.get("remainingQueries").and_then(Value::as_u64),
            payload.get("totalQueries").and_then(Value::as_u64),
            payload.get("windowSizeSeconds").and_then(Value::as_u64),
        ) {
            (Some(remaining), Some(total), Some(window)) => Some(Quota {
                remaining: remaining as u32,
                total: total as u32,
                window_seconds: window,
            }),
            _ => None,
        };
        ProbeOutcome {
            valid: true,
            quota,
            identity: None,
            extra: None,
        }
    }
}
