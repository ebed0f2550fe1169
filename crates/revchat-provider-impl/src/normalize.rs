use std::time::Duration;

use serde_json::Value;

use revchat_protocol::{FramePayload, RawFrame};
use revchat_provider_core::{RateLimitNotice, StreamEvent};

/// In-band rate-limit phrases. These back-ends answer HTTP 200 and put the
/// limit notice in the body, so matching is on content, not status.
/// Upstream copy changes will break this silently; the phrase list mirrors
/// what the services currently send.
const RATE_LIMIT_PHRASES: &[&str] = &[
    "unusual query volume",
    "we've noticed",
    "you've reached your limit",
];

pub fn is_rate_limit_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// Parse the cooldown window out of an X.ai limit message, e.g.
/// "You've reached your limit of 25 queries per 2 hours".
pub fn parse_limit_window(text: &str) -> Option<Duration> {
    let idx = text.find("limit of")?;
    let mut number: Option<u64> = None;
    for word in text[idx..].split_whitespace() {
        if word.starts_with("hour") {
            return number.map(|hours| Duration::from_secs(hours * 3600));
        }
        let digits: String = word.chars().filter(char::is_ascii_digit).collect();
        if !digits.is_empty()
            && let Ok(n) = digits.parse::<u64>()
        {
            number = Some(n);
        }
    }
    None
}

fn rate_limited(text: String, retry_after: Option<Duration>) -> StreamEvent {
    StreamEvent::RateLimited(RateLimitNotice { text, retry_after })
}

/// Maps one decoded frame into canonical stream events. Stateful per
/// session: the You.com mapper tracks whether it is inside a thinking block.
pub trait EventNormalizer: Send {
    fn normalize(&mut self, frame: RawFrame) -> Vec<StreamEvent>;

    /// Events owed when the upstream closes the stream.
    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }
}

/// You.com SSE events: `youChatUpdate` carries chain-of-thought deltas,
/// `youChatToken` the actual reply, `done` terminates.
#[derive(Debug, Default)]
pub struct YouNormalizer {
    thinking: bool,
}

impl YouNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn end_thinking(&mut self, events: &mut Vec<StreamEvent>) {
        if self.thinking {
            self.thinking = false;
            events.push(StreamEvent::ThinkingEnd);
        }
    }
}

impl EventNormalizer for YouNormalizer {
    fn normalize(&mut self, frame: RawFrame) -> Vec<StreamEvent> {
        let text = frame.payload.as_text();
        if is_rate_limit_text(&text) {
            return vec![rate_limited(text, None)];
        }

        let mut events = Vec::new();
        match frame.label.as_deref() {
            Some("youChatUpdate") => {
                if let FramePayload::Json(Value::Object(map)) = &frame.payload
                    && let Some(delta) = map.get("t").and_then(Value::as_str)
                {
                    if !self.thinking {
                        self.thinking = true;
                        events.push(StreamEvent::ThinkingStart);
                    }
                    events.push(StreamEvent::ThinkingDelta(delta.to_string()));
                }
            }
            Some("youChatToken") => {
                self.end_thinking(&mut events);
                let token = match &frame.payload {
                    FramePayload::Json(value) => value
                        .get("youChatToken")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    FramePayload::Text(text) => text.clone(),
                };
                events.push(StreamEvent::TokenDelta(token));
            }
            Some("done") => {
                self.end_thinking(&mut events);
                events.push(StreamEvent::done());
            }
            Some("error") => {
                self.end_thinking(&mut events);
                events.push(StreamEvent::UpstreamError(text));
            }
            _ => {}
        }
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.end_thinking(&mut events);
        events
    }
}

/// Grok.com response objects: `result.response.token` plus an `isSoftStop`
/// completion flag, possibly in the same frame as the final token.
#[derive(Debug, Default)]
pub struct GrokNormalizer;

impl GrokNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl EventNormalizer for GrokNormalizer {
    fn normalize(&mut self, frame: RawFrame) -> Vec<StreamEvent> {
        let text = frame.payload.as_text();
        if is_rate_limit_text(&text) {
            return vec![rate_limited(text, None)];
        }

        let FramePayload::Json(value) = &frame.payload else {
            return Vec::new();
        };
        let response = &value["result"]["response"];
        let mut events = Vec::new();
        if let Some(token) = response.get("token").and_then(Value::as_str)
            && !token.is_empty()
        {
            events.push(StreamEvent::TokenDelta(token.to_string()));
        }
        if response
            .get("isSoftStop")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            events.push(StreamEvent::done());
        }
        if let Some(error) = value.get("error") {
            events.push(StreamEvent::UpstreamError(error.to_string()));
        }
        events
    }
}

/// X.ai response objects: `result.message` text deltas. The limit notice
/// arrives as an ordinary message and carries its own window.
#[derive(Debug, Default)]
pub struct XaiNormalizer;

impl XaiNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl EventNormalizer for XaiNormalizer {
    fn normalize(&mut self, frame: RawFrame) -> Vec<StreamEvent> {
        let text = frame.payload.as_text();
        if is_rate_limit_text(&text) {
            let retry_after = parse_limit_window(&text);
            return vec![rate_limited(text, retry_after)];
        }

        let FramePayload::Json(value) = &frame.payload else {
            return Vec::new();
        };
        if let Some(message) = value["result"].get("message").and_then(Value::as_str) {
            return vec![StreamEvent::TokenDelta(message.to_string())];
        }
        if let Some(error) = value.get("error") {
            return vec![StreamEvent::UpstreamError(error.to_string())];
        }
        Vec::new()
    }
}
