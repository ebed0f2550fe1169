/// Incremental server-sent-events parser.
///
/// Frames are separated by a blank line. A frame's `data:` may arrive split
/// across any number of `push_bytes` calls; the partial frame stays buffered
/// until its blank-line terminator is seen. The buffer is byte-oriented so a
/// multi-byte UTF-8 sequence split across chunks is reassembled before
/// decoding.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(end) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end.frame_len).collect();
            self.buffer.drain(..end.separator_len);
            if let Some(event) = parse_frame(&frame) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing frame the upstream closed without terminating.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let frame = std::mem::take(&mut self.buffer);
        parse_frame(&frame).into_iter().collect()
    }
}

struct FrameEnd {
    frame_len: usize,
    separator_len: usize,
}

fn find_frame_end(buffer: &[u8]) -> Option<FrameEnd> {
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == b'\n' && buffer[i + 1] == b'\n' {
            return Some(FrameEnd {
                frame_len: i,
                separator_len: 2,
            });
        }
        if i + 3 < buffer.len() && &buffer[i..i + 4] == b"\r\n\r\n" {
            return Some(FrameEnd {
                frame_len: i,
                separator_len: 4,
            });
        }
        i += 1;
    }
    None
}

fn parse_frame(frame: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(frame);
    let mut event = None;
    let mut data: Option<String> = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.trim();
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(rest);
                }
                None => data = Some(rest.to_string()),
            }
        }
    }
    data.map(|data| SseEvent { event, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &[u8] = b"event: youChatUpdate\ndata: {\"t\": \"hmm\"}\n\n\
event: youChatToken\ndata: {\"youChatToken\": \"Hello\"}\n\n\
event: done\ndata: I'm done\n\n";

    fn collect_all(parser: &mut SseParser, input: &[u8]) -> Vec<SseEvent> {
        let mut events = parser.push_bytes(input);
        events.extend(parser.finish());
        events
    }

    #[test]
    fn parses_whole_stream() {
        let mut parser = SseParser::new();
        let events = collect_all(&mut parser, STREAM);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event.as_deref(), Some("youChatUpdate"));
        assert_eq!(events[1].data, r#"{"youChatToken": "Hello"}"#);
        assert_eq!(events[2].event.as_deref(), Some("done"));
    }

    #[test]
    fn any_split_point_yields_same_events() {
        let mut whole = SseParser::new();
        let expected = collect_all(&mut whole, STREAM);

        for split in 0..=STREAM.len() {
            let mut parser = SseParser::new();
            let mut events = parser.push_bytes(&STREAM[..split]);
            events.extend(parser.push_bytes(&STREAM[split..]));
            events.extend(parser.finish());
            assert_eq!(events, expected, "split at {split}");
        }
    }

    #[test]
    fn crlf_separators_are_accepted() {
        let mut parser = SseParser::new();
        let events =
            parser.push_bytes(b"event: youChatToken\r\ndata: {\"youChatToken\":\"x\"}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, r#"{"youChatToken":"x"}"#);
    }

    #[test]
    fn frame_without_data_is_dropped() {
        let mut parser = SseParser::new();
        let events = parser.push_bytes(b"event: ping\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn multibyte_utf8_survives_chunk_boundary() {
        let input = "data: {\"t\": \"\u{4f60}\u{597d}\"}\n\n".as_bytes();
        // Split inside the first multi-byte character.
        let split = input.iter().position(|b| *b > 0x7f).unwrap() + 1;
        let mut parser = SseParser::new();
        let mut events = parser.push_bytes(&input[..split]);
        events.extend(parser.push_bytes(&input[split..]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"t\": \"\u{4f60}\u{597d}\"}");
    }
}
