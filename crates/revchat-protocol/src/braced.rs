use serde_json::Value;

/// Incremental parser for streams that carry bare JSON objects back-to-back
/// with no delimiter (the Grok/X.ai chat response shape).
///
/// Scans for balanced `{...}` with a running depth counter and emits one
/// value per balanced object, advancing a cursor so unconsumed trailing
/// bytes stay buffered for the next `push_bytes` call. Observed payloads
/// never contain unescaped braces inside strings, so no string-escape
/// tracking is needed.
#[derive(Debug, Default)]
pub struct BracedJsonParser {
    buffer: Vec<u8>,
}

impl BracedJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut values = Vec::new();
        let mut depth = 0usize;
        let mut start = None;
        let mut consumed = 0usize;

        for (i, byte) in self.buffer.iter().enumerate() {
            match byte {
                b'{' => {
                    if depth == 0 {
                        start = Some(i);
                    }
                    depth += 1;
                }
                b'}' => {
                    if depth == 0 {
                        continue;
                    }
                    depth -= 1;
                    if depth == 0
                        && let Some(open) = start.take()
                    {
                        if let Ok(value) =
                            serde_json::from_slice::<Value>(&self.buffer[open..=i])
                        {
                            values.push(value);
                        }
                        consumed = i + 1;
                    }
                }
                _ => {}
            }
        }

        self.buffer.drain(..consumed);
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TWO_OBJECTS: &[u8] = br#"{"result":{"response":{"token":"Hi","isSoftStop":false}}}{"result":{"response":{"token":"!","isSoftStop":true}}}"#;

    #[test]
    fn back_to_back_objects_in_one_chunk() {
        let mut parser = BracedJsonParser::new();
        let values = parser.push_bytes(TWO_OBJECTS);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["result"]["response"]["token"], json!("Hi"));
        assert_eq!(values[1]["result"]["response"]["isSoftStop"], json!(true));
    }

    #[test]
    fn any_split_point_yields_same_values() {
        let mut whole = BracedJsonParser::new();
        let expected = whole.push_bytes(TWO_OBJECTS);

        for split in 0..=TWO_OBJECTS.len() {
            let mut parser = BracedJsonParser::new();
            let mut values = parser.push_bytes(&TWO_OBJECTS[..split]);
            values.extend(parser.push_bytes(&TWO_OBJECTS[split..]));
            assert_eq!(values, expected, "split at {split}");
        }
    }

    #[test]
    fn partial_object_stays_buffered() {
        let mut parser = BracedJsonParser::new();
        assert!(parser.push_bytes(br#"{"token":"#).is_empty());
        let values = parser.push_bytes(br#""Hi"}"#);
        assert_eq!(values, vec![json!({"token": "Hi"})]);
    }

    #[test]
    fn noise_between_objects_is_ignored() {
        let mut parser = BracedJsonParser::new();
        let values = parser.push_bytes(b"\n{\"a\":1}  \n {\"b\":2}");
        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn nested_objects_count_as_one_frame() {
        let mut parser = BracedJsonParser::new();
        let values = parser.push_bytes(br#"{"outer":{"inner":{"x":1}}}"#);
        assert_eq!(values.len(), 1);
    }
}
