use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use tracing::{info, warn};

use revchat_protocol::FrameDecoder;
use revchat_provider_core::{
    AttemptFailure, CallContext, ChatRequest, Credential, CredentialPool, CredentialValidator,
    EventStream, GatewayError, PoolMark, RateLimitNotice, StreamEvent,
};

use crate::normalize::EventNormalizer;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// One established upstream stream plus back-end-specific attempt context
/// (the You.com adapter tags the chat mode it selected so a rate limit can
/// cool the right mode).
pub struct Connection {
    pub bytes: ByteStream,
    pub tag: Option<String>,
}

impl Connection {
    pub fn new(bytes: ByteStream) -> Self {
        Self { bytes, tag: None }
    }
}

/// How a mid-stream rate limit maps onto pool state. Mode-scoped limits
/// (You.com) cool the chat mode instead of the credential.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDisposition {
    pub cool_credential: bool,
}

impl Default for RateLimitDisposition {
    fn default() -> Self {
        Self {
            cool_credential: true,
        }
    }
}

/// Everything the orchestrator needs from one back-end.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Pre-flight work plus the streaming request itself.
    async fn connect(
        &self,
        credential: &Credential,
        req: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<Connection, AttemptFailure>;

    fn decoder(&self) -> Box<dyn FrameDecoder>;

    fn normalizer(&self) -> Box<dyn EventNormalizer>;

    /// Rebuild the transport with fresh fingerprint parameters after an
    /// anti-bot challenge.
    fn reset_transport(&self) -> Result<(), GatewayError>;

    /// Observe an in-band rate limit and decide whether it is evidence
    /// against the credential or against back-end-specific secondary state.
    fn on_rate_limited(
        &self,
        _tag: Option<&str>,
        _notice: &RateLimitNotice,
    ) -> RateLimitDisposition {
        RateLimitDisposition::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Total connection attempts per request, the first one included.
    pub attempt_budget: u32,
    /// Transport rebuilds per request before challenges fall through to
    /// ordinary credential rotation.
    pub challenge_budget: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            attempt_budget: 3,
            challenge_budget: 2,
        }
    }
}

enum StreamOutcome {
    Done(revchat_provider_core::DoneMeta),
    Closed,
    RateLimited(RateLimitNotice),
    UpstreamError(String),
    Transport(String),
}

/// Drive one chat request end to end: acquire a credential, open the
/// upstream stream, pump bytes through the decoder and normalizer, and fail
/// over within budget when a credential or connection goes bad.
///
/// Canonical events are forwarded as soon as they decode. Once output has
/// been delivered, a failure ends the stream (with a trailing notice for
/// rate limits) instead of retrying, since a retry would replay the prefix.
/// Dropping the returned stream closes the upstream connection without
/// reporting anything to the pool.
pub fn run_chat(
    pool: Arc<CredentialPool>,
    adapter: Arc<dyn BackendAdapter>,
    validator: Arc<dyn CredentialValidator>,
    config: OrchestratorConfig,
    req: ChatRequest,
    ctx: CallContext,
) -> EventStream {
    Box::pin(stream! {
        let mut failed_attempts = 0u32;
        let mut challenge_resets = 0u32;
        let mut excluded: Vec<i64> = Vec::new();
        let mut emitted: u64 = 0;

        'attempts: loop {
            let credential = match pool.acquire_validated(&excluded, validator.as_ref()).await {
                Ok(credential) => credential,
                Err(err) => {
                    warn!(
                        event = "no_credentials",
                        trace_id = %ctx.trace_id,
                        backend = %adapter.backend(),
                        error = %err
                    );
                    yield Err(GatewayError::NoCredentials(err.to_string()));
                    return;
                }
            };
            info!(
                event = "attempt",
                trace_id = %ctx.trace_id,
                backend = %adapter.backend(),
                credential_id = credential.id,
                credential = %credential.secret_preview(),
                attempt = failed_attempts + 1
            );

            let connection = match adapter.connect(&credential, &req, &ctx).await {
                Ok(connection) => connection,
                Err(failure) => {
                    if matches!(failure.error, GatewayError::TransportChallenge)
                        && challenge_resets < config.challenge_budget
                    {
                        challenge_resets += 1;
                        warn!(
                            event = "transport_challenge",
                            trace_id = %ctx.trace_id,
                            backend = %adapter.backend(),
                            reset = challenge_resets
                        );
                        if adapter.reset_transport().is_ok() {
                            // Same credential; challenges are not its fault.
                            continue 'attempts;
                        }
                    }
                    apply_mark(&pool, credential.id, failure.mark);
                    failed_attempts += 1;
                    if failed_attempts < config.attempt_budget {
                        excluded = vec![credential.id];
                        continue 'attempts;
                    }
                    yield Err(failure.error);
                    return;
                }
            };

            let mut bytes = connection.bytes;
            let tag = connection.tag;
            let mut decoder = adapter.decoder();
            let mut normalizer = adapter.normalizer();
            let mut pending: VecDeque<StreamEvent> = VecDeque::new();
            let mut closed = false;

            let outcome = loop {
                let Some(event) = pending.pop_front() else {
                    if closed {
                        break StreamOutcome::Closed;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            for frame in decoder.feed(&chunk) {
                                pending.extend(normalizer.normalize(frame));
                            }
                        }
                        Some(Err(err)) => break StreamOutcome::Transport(err.to_string()),
                        None => {
                            closed = true;
                            for frame in decoder.finish() {
                                pending.extend(normalizer.normalize(frame));
                            }
                            pending.extend(normalizer.finish());
                        }
                    }
                    continue;
                };
                match event {
                    StreamEvent::Done(meta) => break StreamOutcome::Done(meta),
                    StreamEvent::RateLimited(notice) => break StreamOutcome::RateLimited(notice),
                    StreamEvent::UpstreamError(detail) => break StreamOutcome::UpstreamError(detail),
                    StreamEvent::TokenDelta(text) => {
                        emitted += 1;
                        yield Ok(StreamEvent::TokenDelta(text));
                    }
                    StreamEvent::ThinkingDelta(text) => {
                        emitted += 1;
                        yield Ok(StreamEvent::ThinkingDelta(text));
                    }
                    other => yield Ok(other),
                }
            };

            match outcome {
                StreamOutcome::Done(meta) => {
                    pool.report_success(credential.id);
                    yield Ok(StreamEvent::Done(meta));
                    return;
                }
                StreamOutcome::Closed => {
                    // Upstream hung up without a completion signal; callers
                    // still get the single-termination contract.
                    pool.report_success(credential.id);
                    yield Ok(StreamEvent::synthesized_done());
                    return;
                }
                StreamOutcome::RateLimited(notice) => {
                    info!(
                        event = "rate_limited",
                        trace_id = %ctx.trace_id,
                        backend = %adapter.backend(),
                        credential_id = credential.id,
                        emitted,
                        notice = %notice.text
                    );
                    let disposition = adapter.on_rate_limited(tag.as_deref(), &notice);
                    if disposition.cool_credential {
                        pool.report_cooldown(credential.id, notice.retry_after);
                    }
                    if emitted > 0 {
                        // Output already reached the caller; append the
                        // notice instead of dropping the delivered prefix.
                        yield Ok(StreamEvent::TokenDelta(notice.text));
                        yield Ok(StreamEvent::synthesized_done());
                        return;
                    }
                    failed_attempts += 1;
                    if failed_attempts < config.attempt_budget {
                        excluded = vec![credential.id];
                        continue 'attempts;
                    }
                    yield Err(GatewayError::RateLimited(notice.text));
                    return;
                }
                StreamOutcome::UpstreamError(detail) => {
                    warn!(
                        event = "upstream_error",
                        trace_id = %ctx.trace_id,
                        backend = %adapter.backend(),
                        credential_id = credential.id,
                        detail = %detail
                    );
                    if is_auth_error_detail(&detail) {
                        pool.report_invalid(credential.id, &detail);
                    }
                    if emitted > 0 {
                        yield Err(GatewayError::Protocol(detail));
                        return;
                    }
                    failed_attempts += 1;
                    if failed_attempts < config.attempt_budget {
                        excluded = vec![credential.id];
                        continue 'attempts;
                    }
                    yield Err(GatewayError::Protocol(detail));
                    return;
                }
                StreamOutcome::Transport(detail) => {
                    warn!(
                        event = "stream_interrupted",
                        trace_id = %ctx.trace_id,
                        backend = %adapter.backend(),
                        credential_id = credential.id,
                        detail = %detail
                    );
                    if emitted > 0 {
                        yield Err(GatewayError::Connection(detail));
                        return;
                    }
                    failed_attempts += 1;
                    if failed_attempts < config.attempt_budget {
                        excluded = vec![credential.id];
                        continue 'attempts;
                    }
                    yield Err(GatewayError::Connection(detail));
                    return;
                }
            }
        }
    })
}

fn apply_mark(pool: &CredentialPool, id: i64, mark: Option<PoolMark>) {
    match mark {
        Some(PoolMark::Invalid { reason }) => pool.report_invalid(id, &reason),
        Some(PoolMark::Cooldown { duration, .. }) => pool.report_cooldown(id, duration),
        None => {}
    }
}

/// Authorization-class signals occasionally arrive in-band after a 200.
fn is_auth_error_detail(detail: &str) -> bool {
    let lower = detail.to_lowercase();
    detail.contains("401")
        || detail.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
}

#[cfg(test)]
mod tests {
    use super::*;
    use revchat_protocol::BracedFrameDecoder;
    use revchat_provider_core::{
        NoopStateSink, PoolConfig, PoolSnapshot, ProbeOutcome, RotationStrategy,
    };
    use crate::normalize::GrokNormalizer;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysValid;

    #[async_trait]
    impl CredentialValidator for AlwaysValid {
        async fn probe(&self, _credential: &Credential) -> ProbeOutcome {
            ProbeOutcome {
                valid: true,
                ..ProbeOutcome::default()
            }
        }
    }

    /// Scripted adapter: each connect pops the next outcome.
    struct ScriptedAdapter {
        script: Mutex<VecDeque<ScriptStep>>,
        connects: Mutex<Vec<i64>>,
        resets: AtomicU32,
        rate_limit_tags: Mutex<Vec<Option<String>>>,
        cool_credential: bool,
    }

    enum ScriptStep {
        Stream(Vec<Result<Bytes, io::Error>>),
        Fail(AttemptFailure),
    }

    impl ScriptedAdapter {
        fn new(script: Vec<ScriptStep>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                connects: Mutex::new(Vec::new()),
                resets: AtomicU32::new(0),
                rate_limit_tags: Mutex::new(Vec::new()),
                cool_credential: true,
            }
        }
    }

    #[async_trait]
    impl BackendAdapter for ScriptedAdapter {
        fn backend(&self) -> &'static str {
            "scripted"
        }

        async fn connect(
            &self,
            credential: &Credential,
            _req: &ChatRequest,
            _ctx: &CallContext,
        ) -> Result<Connection, AttemptFailure> {
            self.connects.lock().unwrap().push(credential.id);
            match self.script.lock().unwrap().pop_front() {
                Some(ScriptStep::Stream(chunks)) => Ok(Connection::new(Box::pin(
                    futures_util::stream::iter(chunks),
                ))),
                Some(ScriptStep::Fail(failure)) => Err(failure),
                None => Err(AttemptFailure::bare(GatewayError::Connection(
                    "script exhausted".to_string(),
                ))),
            }
        }

        fn decoder(&self) -> Box<dyn FrameDecoder> {
            Box::new(BracedFrameDecoder::new())
        }

        fn normalizer(&self) -> Box<dyn EventNormalizer> {
            Box::new(GrokNormalizer::new())
        }

        fn reset_transport(&self) -> Result<(), GatewayError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_rate_limited(
            &self,
            tag: Option<&str>,
            _notice: &RateLimitNotice,
        ) -> RateLimitDisposition {
            self.rate_limit_tags
                .lock()
                .unwrap()
                .push(tag.map(str::to_string));
            RateLimitDisposition {
                cool_credential: self.cool_credential,
            }
        }
    }

    fn test_pool(n: usize) -> Arc<CredentialPool> {
        Arc::new(CredentialPool::new(
            "scripted",
            PoolConfig {
                strategy: RotationStrategy::RoundRobin,
                ..PoolConfig::default()
            },
            PoolSnapshot::from_secrets((0..n).map(|i| json!(format!("c{i}"))).collect()),
            Arc::new(NoopStateSink),
        ))
    }

    fn token_chunk(token: &str, soft_stop: bool) -> Result<Bytes, io::Error> {
        Ok(Bytes::from(
            json!({"result": {"response": {"token": token, "isSoftStop": soft_stop}}}).to_string(),
        ))
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "Grok.com:grok-3".to_string(),
            messages: vec![],
        }
    }

    async fn collect(stream: EventStream) -> Vec<Result<StreamEvent, GatewayError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn happy_path_emits_tokens_then_done() {
        let pool = test_pool(1);
        let adapter = Arc::new(ScriptedAdapter::new(vec![ScriptStep::Stream(vec![
            token_chunk("Hi", false),
            token_chunk("!", true),
        ])]));
        let events = collect(run_chat(
            pool.clone(),
            adapter,
            Arc::new(AlwaysValid),
            OrchestratorConfig::default(),
            request(),
            CallContext::default(),
        ))
        .await;

        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::TokenDelta("Hi".to_string()),
                StreamEvent::TokenDelta("!".to_string()),
                StreamEvent::done(),
            ]
        );
        assert_eq!(pool.get(0).unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn invalid_credential_rotates_before_any_output() {
        let pool = test_pool(3);
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            ScriptStep::Fail(AttemptFailure {
                error: GatewayError::CredentialInvalid("401".to_string()),
                mark: Some(PoolMark::Invalid {
                    reason: "auth_error 401".to_string(),
                }),
            }),
            ScriptStep::Stream(vec![token_chunk("ok", true)]),
        ]));
        let events = collect(run_chat(
            pool.clone(),
            adapter.clone(),
            Arc::new(AlwaysValid),
            OrchestratorConfig::default(),
            request(),
            CallContext::default(),
        ))
        .await;

        // First token arrives only after the retry; no output before it.
        assert!(matches!(
            events.first(),
            Some(Ok(StreamEvent::TokenDelta(t))) if t == "ok"
        ));
        let connects = adapter.connects.lock().unwrap().clone();
        assert_eq!(connects[0], 0);
        assert_ne!(connects[1], 0, "failed credential must be excluded");
        assert_eq!(
            pool.get(0).unwrap().validity,
            revchat_provider_core::Validity::Invalid
        );
    }

    #[tokio::test]
    async fn rate_limit_with_zero_output_retries_fresh_credential() {
        let pool = test_pool(2);
        let limit = json!({"result": {"response": {"token":
            "We've noticed unusual query volume from your account.", "isSoftStop": false}}});
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            ScriptStep::Stream(vec![Ok(Bytes::from(limit.to_string()))]),
            ScriptStep::Stream(vec![token_chunk("fresh", true)]),
        ]));
        let events = collect(run_chat(
            pool.clone(),
            adapter,
            Arc::new(AlwaysValid),
            OrchestratorConfig::default(),
            request(),
            CallContext::default(),
        ))
        .await;

        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::TokenDelta("fresh".to_string()),
                StreamEvent::done(),
            ]
        );
        assert!(pool.get(0).unwrap().cooldown_until.is_some());
    }

    #[tokio::test]
    async fn rate_limit_after_output_completes_with_trailing_notice() {
        let pool = test_pool(2);
        let notice = "You've reached your limit of 25 queries per 2 hours";
        let adapter = Arc::new(ScriptedAdapter::new(vec![ScriptStep::Stream(vec![
            token_chunk("partial", false),
            Ok(Bytes::from(
                json!({"result": {"response": {"token": notice, "isSoftStop": false}}}).to_string(),
            )),
        ])]));
        let events = collect(run_chat(
            pool.clone(),
            adapter,
            Arc::new(AlwaysValid),
            OrchestratorConfig::default(),
            request(),
            CallContext::default(),
        ))
        .await;

        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(events[0], StreamEvent::TokenDelta("partial".to_string()));
        assert!(matches!(&events[1], StreamEvent::TokenDelta(t) if t.contains("reached your limit")));
        assert!(matches!(events[2], StreamEvent::Done(_)));
        assert!(pool.get(0).unwrap().cooldown_until.is_some());
    }

    #[tokio::test]
    async fn in_band_auth_error_invalidates_and_rotates() {
        let pool = test_pool(2);
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            ScriptStep::Stream(vec![Ok(Bytes::from(
                json!({"error": "403 Forbidden"}).to_string(),
            ))]),
            ScriptStep::Stream(vec![token_chunk("ok", true)]),
        ]));
        let events = collect(run_chat(
            pool.clone(),
            adapter,
            Arc::new(AlwaysValid),
            OrchestratorConfig::default(),
            request(),
            CallContext::default(),
        ))
        .await;

        // Caller sees no output before the retry's first token.
        assert!(matches!(
            events.first(),
            Some(Ok(StreamEvent::TokenDelta(t))) if t == "ok"
        ));
        assert_eq!(
            pool.get(0).unwrap().validity,
            revchat_provider_core::Validity::Invalid
        );
    }

    #[tokio::test]
    async fn transport_challenge_resets_without_consuming_rotation() {
        let pool = test_pool(1);
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            ScriptStep::Fail(AttemptFailure::bare(GatewayError::TransportChallenge)),
            ScriptStep::Stream(vec![token_chunk("ok", true)]),
        ]));
        let events = collect(run_chat(
            pool.clone(),
            adapter.clone(),
            Arc::new(AlwaysValid),
            OrchestratorConfig::default(),
            request(),
            CallContext::default(),
        ))
        .await;

        assert!(events.iter().all(Result::is_ok));
        assert_eq!(adapter.resets.load(Ordering::SeqCst), 1);
        // Same credential both times; the challenge did not rotate it.
        let connects = adapter.connects.lock().unwrap().clone();
        assert_eq!(connects, vec![0, 0]);
    }

    #[tokio::test]
    async fn exhausted_attempt_budget_fails_terminally() {
        let pool = test_pool(3);
        let failure = || {
            ScriptStep::Fail(AttemptFailure::bare(GatewayError::Connection(
                "refused".to_string(),
            )))
        };
        let adapter = Arc::new(ScriptedAdapter::new(vec![failure(), failure(), failure()]));
        let events = collect(run_chat(
            pool,
            adapter,
            Arc::new(AlwaysValid),
            OrchestratorConfig::default(),
            request(),
            CallContext::default(),
        ))
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(GatewayError::Connection(_))));
    }

    #[tokio::test]
    async fn exhausted_pool_is_a_hard_failure() {
        let pool = test_pool(1);
        pool.report_invalid(0, "dead");
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let events = collect(run_chat(
            pool,
            adapter,
            Arc::new(AlwaysValid),
            OrchestratorConfig::default(),
            request(),
            CallContext::default(),
        ))
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(GatewayError::NoCredentials(_))));
    }

    #[tokio::test]
    async fn clean_close_synthesizes_done() {
        let pool = test_pool(1);
        let adapter = Arc::new(ScriptedAdapter::new(vec![ScriptStep::Stream(vec![
            token_chunk("tail", false),
        ])]));
        let events = collect(run_chat(
            pool.clone(),
            adapter,
            Arc::new(AlwaysValid),
            OrchestratorConfig::default(),
            request(),
            CallContext::default(),
        ))
        .await;

        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(events[0], StreamEvent::TokenDelta("tail".to_string()));
        match &events[1] {
            StreamEvent::Done(meta) => assert!(meta.synthesized),
            other => panic!("expected done, got {other:?}"),
        }
        assert_eq!(pool.get(0).unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn cancellation_reports_nothing_to_the_pool() {
        let pool = test_pool(1);
        let adapter = Arc::new(ScriptedAdapter::new(vec![ScriptStep::Stream(vec![
            token_chunk("a", false),
            token_chunk("b", false),
            token_chunk("c", true),
        ])]));
        let mut stream = run_chat(
            pool.clone(),
            adapter,
            Arc::new(AlwaysValid),
            OrchestratorConfig::default(),
            request(),
            CallContext::default(),
        );
        // Take one event, then drop the stream mid-flight.
        let first = stream.next().await;
        assert!(first.is_some());
        drop(stream);

        let cred = pool.get(0).unwrap();
        assert_eq!(cred.usage_count, 0);
        assert!(cred.cooldown_until.is_none());
        assert_eq!(cred.validity, revchat_provider_core::Validity::Valid);
    }
}
