use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use http::header::{AUTHORIZATION, COOKIE};
use http::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::{info, warn};

use revchat_protocol::openai::{ChatMessage, ModelInfo};
use revchat_protocol::{BracedFrameDecoder, FrameDecoder};
use revchat_provider_core::{
    AttemptFailure, CallContext, ChatRequest, Credential, CredentialPool, CredentialValidator,
    EventStream, GatewayError, ProbeOutcome, Provider,
};

use crate::client::TransportSlot;
use crate::normalize::{EventNormalizer, XaiNormalizer};
use crate::orchestrator::{BackendAdapter, Connection, OrchestratorConfig, run_chat};
use crate::provider::missing_secret;
use crate::upstream::{classify_status, network_failure, open_stream};

pub const BACKEND_NAME: &str = "xai";
pub const MODEL_PREFIX: &str = "X.ai:";
const CREATE_CONVERSATION_URL: &str =
    "https://x.com/i/api/graphql/vvC5uy7pWWHXS2aDi1FZeA/CreateGrokConversation";
const ADD_RESPONSE_URL: &str = "https://grok.x.com/2/grok/add_response.json";

pub struct XaiProvider {
    pool: Arc<CredentialPool>,
    adapter: Arc<XaiAdapter>,
    orchestrator: OrchestratorConfig,
}

impl XaiProvider {
    pub fn new(
        pool: CredentialPool,
        transport: Arc<TransportSlot>,
        orchestrator: OrchestratorConfig,
    ) -> Self {
        Self {
            pool: Arc::new(pool),
            adapter: Arc::new(XaiAdapter { transport }),
            orchestrator,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }
}

#[async_trait]
impl Provider for XaiProvider {
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

    /// The grok-on-X surface has no catalog endpoint; the two execution
    /// shapes of the one model are advertised statically.
    async fn list_models(&self, _ctx: CallContext) -> Result<Vec<ModelInfo>, GatewayError> {
        let mut single = ModelInfo::new(format!("{MODEL_PREFIX}grok-3:single"), "x.ai");
        single.context_length = Some(8192);
        let mut dialog = ModelInfo::new(format!("{MODEL_PREFIX}grok-3:dialog"), "x.ai");
        dialog.context_length = Some(8192);
        Ok(vec![single, dialog])
    }
}

struct XaiAdapter {
    transport: Arc<TransportSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageFormat {
    /// History collapsed into one user message.
    Single,
    /// Turn-by-turn history with sender roles preserved.
    Dialog,
}

fn parse_model(model: &str) -> (String, MessageFormat) {
    let model = model.strip_prefix(MODEL_PREFIX).unwrap_or(model);
    let format = if model.ends_with(":single") {
        MessageFormat::Single
    } else {
        MessageFormat::Dialog
    };
    let id = model
        .trim_end_matches(":single")
        .trim_end_matches(":dialog")
        .to_string();
    (id, format)
}

fn format_messages(
    messages: &[ChatMessage],
    format: MessageFormat,
) -> Result<Vec<Value>, AttemptFailure> {
    if !messages.last().is_some_and(ChatMessage::is_user) {
        return Err(AttemptFailure::bare(GatewayError::Protocol(
            "last message must be a user message".to_string(),
        )));
    }
    let formatted = match format {
        MessageFormat::Single => {
            let combined = messages
                .iter()
                .map(|message| message.content.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            vec![json!({"message": combined, "sender": 1, "fileAttachments": []})]
        }
        MessageFormat::Dialog => messages
            .iter()
            .map(|message| {
                let sender = if message.is_user() { 1 } else { 2 };
                json!({"message": message.content, "sender": sender, "fileAttachments": []})
            })
            .collect(),
    };
    Ok(formatted)
}

fn chat_body(responses: Vec<Value>, model_id: &str, conversation_id: &str) -> Value {
    json!({
        "responses": responses,
        "systemPromptName": "",
        "grokModelOptionId": model_id,
        "conversationId": conversation_id,
        "returnSearchResults": true,
        "returnCitations": true,
        "promptMetadata": {"promptSource": "NATURAL", "action": "INPUT"},
        "imageGenerationCount": 4,
        "requestFeatures": {"eagerTweets": false, "serverHistory": true},
        "enableCustomization": false,
        "enableSideBySide": true,
        "toolOverrides": {},
        "isDeepsearch": false,
        "isReasoning": false
    })
}

fn credential_headers(credential: &Credential) -> Result<HeaderMap, AttemptFailure> {
    let secret = &credential.secret;
    let cookie = secret
        .get("cookie")
        .and_then(Value::as_str)
        .ok_or_else(|| missing_secret("cookie"))?;
    let authorization = secret
        .get("authorization")
        .and_then(Value::as_str)
        .ok_or_else(|| missing_secret("authorization"))?;
    let csrf = secret
        .get("x-csrf-token")
        .and_then(Value::as_str)
        .ok_or_else(|| missing_secret("x-csrf-token"))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        COOKIE,
        HeaderValue::from_str(cookie).map_err(|_| missing_secret("well-formed cookie"))?,
    );
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(authorization)
            .map_err(|_| missing_secret("well-formed authorization"))?,
    );
    headers.insert(
        "x-csrf-token",
        HeaderValue::from_str(csrf).map_err(|_| missing_secret("well-formed x-csrf-token"))?,
    );
    Ok(headers)
}

impl XaiAdapter {
    /// A new conversation id is required per chat; the same call doubles as
    /// the validity probe.
    async fn create_conversation(
        &self,
        headers: &HeaderMap,
        ctx: &CallContext,
    ) -> Result<String, AttemptFailure> {
        let response = self
            .transport
            .client()
            .post(CREATE_CONVERSATION_URL)
            .headers(headers.clone())
            .send()
            .await
            .map_err(network_failure)?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            warn!(
                event = "create_conversation_failed",
                trace_id = %ctx.trace_id,
                backend = BACKEND_NAME,
                status = status.as_u16()
            );
            return Err(classify_status(status, &headers, &body));
        }
        let payload: Value = response.json().await.map_err(|err| {
            AttemptFailure::bare(GatewayError::Protocol(format!(
                "conversation response unreadable: {err}"
            )))
        })?;
        payload["data"]["create_grok_conversation"]["conversation_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                AttemptFailure::bare(GatewayError::Protocol(
                    "conversation response missing conversation_id".to_string(),
                ))
            })
    }
}

#[async_trait]
impl BackendAdapter for XaiAdapter {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn connect(
        &self,
        credential: &Credential,
        req: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<Connection, AttemptFailure> {
        let headers = credential_headers(credential)?;
        let (model_id, format) = parse_model(&req.model);
        let responses = format_messages(&req.messages, format)?;

        let conversation_id = self.create_conversation(&headers, ctx).await?;
        let body = chat_body(responses, &model_id, &conversation_id);

        let started_at = Instant::now();
        info!(
            event = "upstream_request",
            trace_id = %ctx.trace_id,
            backend = BACKEND_NAME,
            op = "chat",
            model = %model_id,
            format = ?format,
            conversation_id = %conversation_id,
            credential_id = credential.id
        );
        let response = self
            .transport
            .client()
            .post(ADD_RESPONSE_URL)
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
        Box::new(XaiNormalizer::new())
    }

    fn reset_transport(&self) -> Result<(), GatewayError> {
        self.transport.reset()
    }
}

#[async_trait]
impl CredentialValidator for XaiAdapter {
    async fn probe(&self, credential: &Credential) -> ProbeOutcome {
        let Ok(headers) = credential_headers(credential) else {
            return ProbeOutcome::invalid();
        };
        let ctx = CallContext::default();
        match self.create_conversation(&headers, &ctx).await {
            Ok(_) => ProbeOutcome {
                valid: true,
                ..ProbeOutcome::default()
            },
            Err(failure) => {
                warn!(
                    event = "probe_failed",
                    backend = BACKEND_NAME,
                    credential_id = credential.id,
                    error = %failure.error
                );
                ProbeOutcome::invalid()
            }
        }
    }
}
