use serde_json::Value;

use crate::braced::BracedJsonParser;
use crate::sse::{SseEvent, SseParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Event,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Json(Value),
    Text(String),
}

impl FramePayload {
    /// Flattened text view of the payload, used for content-based signal
    /// detection (rate-limit phrases arrive inside otherwise ordinary frames).
    pub fn as_text(&self) -> String {
        match self {
            FramePayload::Text(text) => text.clone(),
            FramePayload::Json(value) => match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// One complete unit of upstream streaming protocol data: an SSE event or a
/// balanced JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub kind: FrameKind,
    pub label: Option<String>,
    pub payload: FramePayload,
}

impl RawFrame {
    pub fn json(value: Value) -> Self {
        Self {
            kind: FrameKind::Json,
            label: None,
            payload: FramePayload::Json(value),
        }
    }

    /// SSE data is JSON-decoded when possible, else kept as raw text.
    pub fn from_sse(event: SseEvent) -> Self {
        let payload = match serde_json::from_str::<Value>(&event.data) {
            Ok(value) => FramePayload::Json(value),
            Err(_) => FramePayload::Text(event.data),
        };
        Self {
            kind: FrameKind::Event,
            label: event.event,
            payload,
        }
    }
}

/// Common contract over the per-back-end wire shapes: consume raw byte
/// chunks, emit complete frames, buffer partial frames across chunk
/// boundaries. Decoders are per-session and never block; absent a complete
/// frame, `feed` simply returns nothing and retains the partial buffer.
pub trait FrameDecoder: Send {
    fn feed(&mut self, chunk: &[u8]) -> Vec<RawFrame>;

    /// Flush whatever a closed connection left behind.
    fn finish(&mut self) -> Vec<RawFrame> {
        Vec::new()
    }
}

/// SSE-shaped streams (You.com).
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    parser: SseParser,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for SseFrameDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.parser
            .push_bytes(chunk)
            .into_iter()
            .map(RawFrame::from_sse)
            .collect()
    }

    fn finish(&mut self) -> Vec<RawFrame> {
        self.parser
            .finish()
            .into_iter()
            .map(RawFrame::from_sse)
            .collect()
    }
}

/// Brace-counted JSON-in-text streams (Grok.com, X.ai chat responses).
#[derive(Debug, Default)]
pub struct BracedFrameDecoder {
    parser: BracedJsonParser,
}

impl BracedFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for BracedFrameDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.parser
            .push_bytes(chunk)
            .into_iter()
            .map(RawFrame::json)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decoder_contract_covers_both_wire_shapes() {
        let mut sse = SseFrameDecoder::new();
        let frames = sse.feed(b"event: youChatToken\ndata: {\"youChatToken\":\"a\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Event);

        let mut braced = BracedFrameDecoder::new();
        let frames = braced.feed(br#"{"result":{}}"#);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Json);
    }

    #[test]
    fn sse_data_decodes_json_when_possible() {
        let frame = RawFrame::from_sse(SseEvent {
            event: Some("youChatToken".to_string()),
            data: r#"{"youChatToken":"Hi"}"#.to_string(),
        });
        assert_eq!(frame.kind, FrameKind::Event);
        assert_eq!(frame.label.as_deref(), Some("youChatToken"));
        assert_eq!(frame.payload, FramePayload::Json(json!({"youChatToken": "Hi"})));
    }

    #[test]
    fn sse_data_falls_back_to_text() {
        let frame = RawFrame::from_sse(SseEvent {
            event: Some("done".to_string()),
            data: "I'm done".to_string(),
        });
        assert_eq!(frame.payload, FramePayload::Text("I'm done".to_string()));
    }

    #[test]
    fn payload_text_view_unwraps_strings() {
        let payload = FramePayload::Json(json!("plain"));
        assert_eq!(payload.as_text(), "plain");
        let payload = FramePayload::Json(json!({"t": "x"}));
        assert_eq!(payload.as_text(), r#"{"t":"x"}"#);
    }
}
