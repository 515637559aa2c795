//! Incremental decoding of `data: ` framed response bodies.

use serde_json::Value;

const DATA_PREFIX: &str = "data: ";

/// One decoded unit of streamed output.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Json(Value),
    /// The data line was not valid JSON; carried verbatim.
    Text(String),
}

impl Chunk {
    /// Best-effort text content for display.
    pub fn text(&self) -> Option<&str> {
        match self {
            Chunk::Text(text) => Some(text),
            Chunk::Json(Value::String(text)) => Some(text),
            Chunk::Json(Value::Object(map)) => ["text", "content", "delta"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str)),
            Chunk::Json(_) => None,
        }
    }
}

/// Holds bytes of an unfinished UTF-8 sequence and the text of an
/// unterminated line between deliveries.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Chunk> {
        self.decode(bytes);

        let mut chunks = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=idx).collect();
            if let Some(chunk) = parse_line(&line) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Flushes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<Chunk> {
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }

        let rest = std::mem::take(&mut self.buffer);
        rest.split('\n').filter_map(parse_line).collect()
    }

    fn decode(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match err.error_len() {
                        // Incomplete sequence at the end; wait for more bytes.
                        None => {
                            self.pending.drain(..valid_up_to);
                            return;
                        }
                        Some(invalid) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                    }
                }
            }
        }
    }
}

fn parse_line(line: &str) -> Option<Chunk> {
    let line = line.trim_end_matches('\n').trim_end_matches('\r');
    let data = line.strip_prefix(DATA_PREFIX)?;
    if data.trim().is_empty() {
        return None;
    }

    Some(match serde_json::from_str::<Value>(data) {
        Ok(value) => Chunk::Json(value),
        Err(_) => Chunk::Text(data.to_string()),
    })
}
