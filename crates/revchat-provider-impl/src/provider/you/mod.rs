pub mod modes;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;
use wreq::multipart::{Form, Part};

use revchat_protocol::openai::{ChatMessage, ModelInfo};
use revchat_protocol::{FrameDecoder, SseFrameDecoder};
use revchat_provider_core::{
    AttemptFailure, CallContext, ChatRequest, Credential, CredentialPool, CredentialValidator,
    EventStream, GatewayError, ProbeOutcome, Provider, RateLimitNotice,
};

use crate::client::TransportSlot;
use crate::normalize::{EventNormalizer, YouNormalizer};
use crate::orchestrator::{
    BackendAdapter, Connection, OrchestratorConfig, RateLimitDisposition, run_chat,
};
use crate::provider::{cookie_headers, credential_cookie, missing_secret, strip_model_prefix};
use crate::upstream::{network_failure, open_stream};

use modes::{CUSTOM_MODE, ModeChoice, ModeConfig, ModeRegistry};

pub const BACKEND_NAME: &str = "you";
pub const MODEL_PREFIX: &str = "You.com:";
const BASE_URL: &str = "https://you.com";
// Build-pinned page-data path; doubles as the cheapest authenticated call.
const SESSION_PROBE_PATH: &str =
    "/_next/data/ee50cd42bdfa0bd3ad044daa2349a6179381d5ef/en-US/search.json";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct YouSettings {
    /// Replaces the outgoing user message when non-empty; the real history
    /// still travels in the uploaded transcript.
    #[serde(default)]
    pub custom_message: String,
    /// Fixed upload filename; empty means a random `<hex>.txt` per request.
    #[serde(default)]
    pub custom_filename: String,
    /// Prefix transcript lines with `Human:` / `Assistant:`.
    #[serde(default)]
    pub history_prefixes: bool,
}

pub struct YouProvider {
    pool: Arc<CredentialPool>,
    adapter: Arc<YouAdapter>,
    orchestrator: OrchestratorConfig,
}

impl YouProvider {
    pub fn new(
        pool: CredentialPool,
        transport: Arc<TransportSlot>,
        settings: YouSettings,
        mode_config: ModeConfig,
        orchestrator: OrchestratorConfig,
    ) -> Self {
        let pool = Arc::new(pool);
        Self {
            adapter: Arc::new(YouAdapter {
                transport,
                settings,
                modes: ModeRegistry::new(mode_config),
                pool: pool.clone(),
                models: Mutex::new(Vec::new()),
            }),
            pool,
            orchestrator,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }
}

#[async_trait]
impl Provider for YouProvider {
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

    /// Catalog comes from the session page data captured by the last probe;
    /// an empty cache forces a probe against an admissible credential.
    async fn list_models(&self, _ctx: CallContext) -> Result<Vec<ModelInfo>, GatewayError> {
        {
            let cached = self.adapter.models.lock().unwrap_or_else(|p| p.into_inner());
            if !cached.is_empty() {
                return Ok(cached.clone());
            }
        }
        let credential = self
            .pool
            .acquire(&[])
            .map_err(|err| GatewayError::NoCredentials(err.to_string()))?;
        self.pool
            .revalidate(credential.id, self.adapter.as_ref())
            .await;
        let cached = self.adapter.models.lock().unwrap_or_else(|p| p.into_inner());
        Ok(cached.clone())
    }
}

struct YouAdapter {
    transport: Arc<TransportSlot>,
    settings: YouSettings,
    modes: ModeRegistry,
    pool: Arc<CredentialPool>,
    models: Mutex<Vec<ModelInfo>>,
}

/// Render OpenAI-shaped history to the transcript uploaded as a file source.
fn render_transcript(messages: &[ChatMessage], prefixes: bool) -> String {
    let mut transcript = String::new();
    for message in messages {
        if prefixes {
            let prefix = match message.role.as_str() {
                "user" => "Human".to_string(),
                "assistant" => "Assistant".to_string(),
                other => {
                    let mut chars = other.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                        None => String::new(),
                    }
                }
            };
            transcript.push_str(&format!("{prefix}: {}\n\n", message.content));
        } else {
            transcript.push_str(&format!("{}\n\n", message.content));
        }
    }
    transcript
}

fn random_filename() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}.txt", &hex[..6])
}

impl YouAdapter {
    async fn upload_transcript(
        &self,
        headers: &http::HeaderMap,
        filename: &str,
        transcript: String,
        ctx: &CallContext,
    ) -> Result<Value, AttemptFailure> {
        let size_bytes = transcript.len();
        let part = Part::bytes(transcript.into_bytes())
            .file_name(filename.to_string())
            .mime_str("text/plain")
            .map_err(|err| {
                AttemptFailure::bare(GatewayError::Protocol(format!("upload part: {err}")))
            })?;
        let form = Form::new().part("file", part);

        info!(
            event = "upstream_request",
            trace_id = %ctx.trace_id,
            backend = BACKEND_NAME,
            op = "upload",
            filename = %filename,
            size_bytes
        );
        let response = self
            .transport
            .client()
            .post(format!("{BASE_URL}/api/upload"))
            .headers(headers.clone())
            .multipart(form)
            .send()
            .await
            .map_err(network_failure)?;
        let status = response.status();
        if !status.is_success() {
            let resp_headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            warn!(
                event = "upload_failed",
                trace_id = %ctx.trace_id,
                backend = BACKEND_NAME,
                status = status.as_u16()
            );
            return Err(crate::upstream::classify_status(status, &resp_headers, &body));
        }
        let result: Value = response.json().await.map_err(|err| {
            AttemptFailure::bare(GatewayError::Protocol(format!(
                "upload response unreadable: {err}"
            )))
        })?;
        Ok(json!({
            "source_type": "user_file",
            "filename": result.get("filename").cloned().unwrap_or_default(),
            "user_filename": result
                .get("user_filename")
                .cloned()
                .unwrap_or_else(|| Value::String(filename.to_string())),
            "size_bytes": size_bytes,
        }))
    }

    /// Provision an agent mode for a model the registry has none for.
    async fn create_agent(
        &self,
        headers: &http::HeaderMap,
        model: &str,
        ctx: &CallContext,
    ) -> Option<String> {
        let name = Uuid::new_v4().simple().to_string()[..5].to_string();
        let payload = json!({
            "aiModel": model,
            "name": name,
            "instructions": "",
            "instructionsSummary": "",
            "isUserOwned": true,
            "visibility": "public",
            "hideInstructions": false,
            "teams": [],
            "hasLiveWebAccess": false,
            "hasPersonalization": true,
            "includeFollowUps": false,
            "advancedReasoningMode": "off",
            "sources": [],
            "webAccessConfig": {}
        });
        let response = self
            .transport
            .client()
            .post(format!("{BASE_URL}/api/custom_assistants/assistants"))
            .headers(headers.clone())
            .json(&payload)
            .send()
            .await;
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(
                    event = "agent_create_failed",
                    trace_id = %ctx.trace_id,
                    backend = BACKEND_NAME,
                    model,
                    status = response.status().as_u16()
                );
                return None;
            }
            Err(err) => {
                warn!(
                    event = "agent_create_failed",
                    trace_id = %ctx.trace_id,
                    backend = BACKEND_NAME,
                    model,
                    error = %err
                );
                return None;
            }
        };
        let agent_id = response
            .json::<Value>()
            .await
            .ok()?
            .get("chat_mode_id")?
            .as_str()
            .filter(|id| !id.is_empty())
            .map(str::to_string)?;
        self.modes.register_agent(model, &agent_id);
        Some(agent_id)
    }

    async fn resolve_mode(
        &self,
        headers: &http::HeaderMap,
        model: &str,
        ctx: &CallContext,
    ) -> String {
        match self.modes.select(model) {
            ModeChoice::Custom => CUSTOM_MODE.to_string(),
            ModeChoice::Agent(id) => id,
            ModeChoice::AgentWanted => self
                .create_agent(headers, model, ctx)
                .await
                .unwrap_or_else(|| CUSTOM_MODE.to_string()),
        }
    }
}

#[async_trait]
impl BackendAdapter for YouAdapter {
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

        let message = if self.settings.custom_message.is_empty() {
            req.last_user_message()
                .ok_or_else(|| {
                    AttemptFailure::bare(GatewayError::Protocol(
                        "request has no user message".to_string(),
                    ))
                })?
                .to_string()
        } else {
            self.settings.custom_message.clone()
        };
        let filename = if self.settings.custom_filename.is_empty() {
            random_filename()
        } else {
            self.settings.custom_filename.clone()
        };

        let transcript = render_transcript(&req.messages, self.settings.history_prefixes);
        let file_info = self
            .upload_transcript(&headers, &filename, transcript, ctx)
            .await?;

        self.modes.note_rotation(self.pool.rotation_tick());
        let mode = self.resolve_mode(&headers, model, ctx).await;

        let chat_id = Uuid::new_v4().to_string();
        let turn_id = Uuid::new_v4().to_string();
        let now_millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let trace = format!("{chat_id}|{turn_id}|{now_millis}");
        let sources = serde_json::to_string(&json!([file_info])).unwrap_or_default();

        let params: Vec<(&str, String)> = vec![
            ("page", "1".to_string()),
            ("count", "10".to_string()),
            ("safeSearch", "Off".to_string()),
            ("mkt", "en-GB".to_string()),
            ("enable_worklow_generation_ux", "true".to_string()),
            ("incognito", "true".to_string()),
            ("domain", "youchat".to_string()),
            ("use_personalization_extraction", "true".to_string()),
            ("queryTraceId", chat_id.clone()),
            ("chatId", chat_id.clone()),
            ("conversationTurnId", turn_id.clone()),
            ("pastChatLength", "0".to_string()),
            ("selectedChatMode", mode.clone()),
            ("selectedAiModel", model.to_string()),
            ("enable_agent_clarification_questions", "true".to_string()),
            ("traceId", trace),
            ("use_nested_youchat_updates", "true".to_string()),
            ("q", message),
            ("sources", sources),
            ("chat", "[]".to_string()),
        ];

        let started_at = Instant::now();
        info!(
            event = "upstream_request",
            trace_id = %ctx.trace_id,
            backend = BACKEND_NAME,
            op = "chat",
            model = %model,
            mode = %mode,
            credential_id = credential.id
        );
        let response = self
            .transport
            .client()
            .get(format!("{BASE_URL}/api/streamingSearch"))
            .headers(headers)
            .query(&params)
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
        let bytes = open_stream(response).await?;
        Ok(Connection {
            bytes,
            tag: Some(mode),
        })
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(SseFrameDecoder::new())
    }

    fn normalizer(&self) -> Box<dyn EventNormalizer> {
        Box::new(YouNormalizer::new())
    }

    fn reset_transport(&self) -> Result<(), GatewayError> {
        self.transport.reset()
    }

    /// You.com limits bind to the chat mode, not the cookie: cool the mode
    /// that was used and leave the credential in rotation.
    fn on_rate_limited(
        &self,
        tag: Option<&str>,
        _notice: &RateLimitNotice,
    ) -> RateLimitDisposition {
        match tag {
            Some(mode) => {
                self.modes.start_cooldown(mode);
                RateLimitDisposition {
                    cool_credential: false,
                }
            }
            None => RateLimitDisposition::default(),
        }
    }
}

#[async_trait]
impl CredentialValidator for YouAdapter {
    /// Fetch the session page data: proves the cookie, resolves the account
    /// email and subscription tier, and refreshes the model catalog cache.
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
            .get(format!("{BASE_URL}{SESSION_PROBE_PATH}"))
            .headers(headers)
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

        let page_props = &payload["pageProps"];
        let email = page_props["launchDarklyContext"]["email"]
            .as_str()
            .unwrap_or("UNKNOWN")
            .to_string();
        let tier = page_props["youProState"]["subscriptions"]
            .as_array()
            .and_then(|subs| subs.first())
            .and_then(|sub| sub.get("tier"))
            .and_then(Value::as_str)
            .unwrap_or("free")
            .to_string();

        if let Some(models) = page_props["aiModels"].as_array() {
            let catalog: Vec<ModelInfo> = models
                .iter()
                .filter_map(|model| {
                    let id = model.get("id").and_then(Value::as_str)?;
                    let mut info = ModelInfo::new(
                        format!("{MODEL_PREFIX}{id}"),
                        model
                            .get("company")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown"),
                    );
                    info.context_length = model.get("contextLimit").and_then(Value::as_u64);
                    Some(info)
                })
                .collect();
            if !catalog.is_empty() {
                *self.models.lock().unwrap_or_else(|p| p.into_inner()) = catalog;
            }
        }

        info!(
            event = "probe_ok",
            backend = BACKEND_NAME,
            credential_id = credential.id,
            email = %email,
            tier = %tier
        );
        ProbeOutcome {
            valid: true,
            quota: None,
            identity: Some(email.clone()),
            extra: Some(json!({"email": email, "subscription_tier": tier})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn transcript_without_prefixes_joins_contents() {
        let transcript = render_transcript(
            &[message("user", "hi"), message("assistant", "hello")],
            false,
        );
        assert_eq!(transcript, "hi\n\nhello\n\n");
    }

    #[test]
    fn transcript_with_prefixes_labels_roles() {
        let transcript = render_transcript(
            &[
                message("user", "hi"),
                message("assistant", "hello"),
                message("system", "rules"),
            ],
            true,
        );
        assert_eq!(
            transcript,
            "Human: hi\n\nAssistant: hello\n\nSystem: rules\n\n"
        );
    }

    #[test]
    fn random_filenames_are_short_txt() {
        let name = random_filename();
        assert!(name.ends_with(".txt"));
        assert_eq!(name.len(), 10);
    }
}
