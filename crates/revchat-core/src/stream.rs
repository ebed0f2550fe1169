use std::convert::Infallible;

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use revchat_protocol::openai::ChatCompletionChunk;
use revchat_provider_core::{EventStream, GatewayError, StreamEvent};

use crate::error::{error_body, error_type_for};

/// Markers wrapping chain-of-thought output inside the content stream, so
/// OpenAI-only clients still see where thinking starts and ends.
pub const THINKING_OPEN: &str = "<Model_thinking>\n\n";
pub const THINKING_CLOSE: &str = "\n\n</Model_thinking>\n\n";

fn data_frame(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

/// Encode the canonical event stream as OpenAI `chat.completion.chunk` SSE.
///
/// The encoding always terminates with a `finish_reason: "stop"` chunk and
/// `data: [DONE]`, regardless of how the canonical stream ended; terminal
/// errors become an in-band error frame first.
pub fn encode_sse(
    events: EventStream,
    id: String,
    created: i64,
    model: String,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    stream! {
        let mut events = events;
        let content_chunk = |content: String| {
            let chunk = ChatCompletionChunk::content(&id, created, &model, content);
            serde_json::to_string(&chunk).unwrap_or_default()
        };
        while let Some(item) = events.next().await {
            match item {
                Ok(StreamEvent::ThinkingStart) => {
                    yield Ok(data_frame(&content_chunk(THINKING_OPEN.to_string())));
                }
                Ok(StreamEvent::ThinkingDelta(text)) => {
                    yield Ok(data_frame(&content_chunk(text)));
                }
                Ok(StreamEvent::ThinkingEnd) => {
                    yield Ok(data_frame(&content_chunk(THINKING_CLOSE.to_string())));
                }
                Ok(StreamEvent::TokenDelta(text)) => {
                    yield Ok(data_frame(&content_chunk(text)));
                }
                Ok(StreamEvent::Done(_)) => break,
                // The orchestrator never forwards these, but the encoding
                // stays total over the event vocabulary.
                Ok(StreamEvent::RateLimited(notice)) => {
                    yield Ok(data_frame(&content_chunk(notice.text)));
                }
                Ok(StreamEvent::UpstreamError(detail)) => {
                    yield Ok(data_frame(&error_body(
                        &detail,
                        "upstream_protocol_error",
                    )));
                    break;
                }
                Err(err) => {
                    yield Ok(data_frame(&error_body(&err.to_string(), error_type_for(&err))));
                    break;
                }
            }
        }
        let finish = ChatCompletionChunk::finish(&id, created, &model, "stop");
        yield Ok(data_frame(&serde_json::to_string(&finish).unwrap_or_default()));
        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
    }
}

/// Collect the canonical stream into one assistant message for the
/// non-streaming response shape.
pub async fn collect_content(mut events: EventStream) -> Result<String, GatewayError> {
    let mut content = String::new();
    while let Some(item) = events.next().await {
        match item? {
            StreamEvent::ThinkingStart => content.push_str(THINKING_OPEN),
            StreamEvent::ThinkingDelta(text) => content.push_str(&text),
            StreamEvent::ThinkingEnd => content.push_str(THINKING_CLOSE),
            StreamEvent::TokenDelta(text) => content.push_str(&text),
            StreamEvent::RateLimited(notice) => content.push_str(&notice.text),
            StreamEvent::UpstreamError(detail) => {
                return Err(GatewayError::Protocol(detail));
            }
            StreamEvent::Done(_) => break,
        }
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revchat_provider_core::{DoneMeta, RateLimitNotice};

    fn events(items: Vec<Result<StreamEvent, GatewayError>>) -> EventStream {
        Box::pin(futures_util::stream::iter(items))
    }

    async fn encode_all(items: Vec<Result<StreamEvent, GatewayError>>) -> String {
        let encoded: Vec<Result<Bytes, Infallible>> = encode_sse(
            events(items),
            "chatcmpl-test".to_string(),
            0,
            "You.com:claude_3_5_sonnet".to_string(),
        )
        .collect()
        .await;
        encoded
            .into_iter()
            .map(|item| String::from_utf8(item.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn thinking_markers_wrap_deltas() {
        let text = encode_all(vec![
            Ok(StreamEvent::ThinkingStart),
            Ok(StreamEvent::ThinkingDelta("step".to_string())),
            Ok(StreamEvent::ThinkingEnd),
            Ok(StreamEvent::TokenDelta("hi".to_string())),
            Ok(StreamEvent::Done(DoneMeta::default())),
        ])
        .await;
        assert!(text.contains("<Model_thinking>"));
        assert!(text.contains("</Model_thinking>"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn every_stream_ends_with_stop_and_done_marker() {
        let text = encode_all(vec![Ok(StreamEvent::TokenDelta("x".to_string()))]).await;
        assert!(text.contains(r#""finish_reason":"stop""#));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn terminal_error_is_labeled_in_band() {
        let text = encode_all(vec![
            Ok(StreamEvent::TokenDelta("partial".to_string())),
            Err(GatewayError::Connection("reset".to_string())),
        ])
        .await;
        assert!(text.contains("connection_error"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn chunks_are_well_formed_openai_frames() {
        let text = encode_all(vec![
            Ok(StreamEvent::TokenDelta("hello".to_string())),
            Ok(StreamEvent::Done(DoneMeta::default())),
        ])
        .await;
        let first = text.split("\n\n").next().unwrap();
        let payload = first.strip_prefix("data: ").unwrap();
        let chunk: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hello");
    }

    #[tokio::test]
    async fn collect_joins_tokens_and_thinking() {
        let content = collect_content(events(vec![
            Ok(StreamEvent::ThinkingStart),
            Ok(StreamEvent::ThinkingDelta("why".to_string())),
            Ok(StreamEvent::ThinkingEnd),
            Ok(StreamEvent::TokenDelta("answer".to_string())),
            Ok(StreamEvent::RateLimited(RateLimitNotice {
                text: " (limited)".to_string(),
                retry_after: None,
            })),
            Ok(StreamEvent::Done(DoneMeta::default())),
        ]))
        .await
        .unwrap();
        assert!(content.starts_with(THINKING_OPEN));
        assert!(content.contains("answer"));
        assert!(content.ends_with(" (limited)"));
    }

    #[tokio::test]
    async fn collect_propagates_terminal_errors() {
        let result = collect_content(events(vec![
            Ok(StreamEvent::TokenDelta("x".to_string())),
            Err(GatewayError::RateLimited("limited".to_string())),
        ]))
        .await;
        assert!(matches!(result, Err(GatewayError::RateLimited(_))));
    }
}
