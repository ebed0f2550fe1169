use std::pin::Pin;
use std::time::Duration;

use futures_core::Stream;

use crate::error::GatewayError;

/// In-band rate-limit signal. These back-ends answer HTTP 200 with a limit
/// message in the body, so detection is content-based; `retry_after` is only
/// set when the message itself names a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitNotice {
    pub text: String,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoneMeta {
    /// True when the upstream closed without an explicit completion signal
    /// and the event was synthesized to keep the termination contract.
    pub synthesized: bool,
}

/// The canonical back-end-agnostic stream vocabulary. Every adapter's wire
/// format reduces to this before anything reaches the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ThinkingStart,
    ThinkingDelta(String),
    ThinkingEnd,
    TokenDelta(String),
    Done(DoneMeta),
    RateLimited(RateLimitNotice),
    UpstreamError(String),
}

impl StreamEvent {
    pub fn done() -> Self {
        StreamEvent::Done(DoneMeta::default())
    }

    pub fn synthesized_done() -> Self {
        StreamEvent::Done(DoneMeta { synthesized: true })
    }
}

/// What a `Provider::chat` call hands back: canonical events until a single
/// terminal item, either `Done` or an error.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, GatewayError>> + Send>>;
