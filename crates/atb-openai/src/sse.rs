//! Incremental Server-Sent Events framing for run streams.

use atb_core::{errors::Error, Result};

/// Upper bound on buffered bytes without a frame boundary.
const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some((pos, delim_len)) = find_boundary(&self.buffer[start..]) {
            let raw = &self.buffer[start..start + pos];
            start += pos + delim_len;
            let text = std::str::from_utf8(raw)
                .map_err(|_| Error::External("invalid UTF-8 in SSE stream".to_string()))?;
            if let Some(frame) = parse_frame(text) {
                frames.push(frame);
            }
        }
        self.buffer.drain(..start);
        if self.buffer.len() > MAX_SSE_BUFFER_BYTES {
            return Err(Error::External(
                "SSE buffer exceeded maximum size (4 MiB)".to_string(),
            ));
        }
        Ok(frames)
    }
}

fn find_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    // A CRLF boundary can only win if it starts at or before the LF one.
    let limit = lf.map_or(buffer.len(), |(p, _)| (p + 4).min(buffer.len()));
    let crlf = buffer[..limit]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Option<String> = None;

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(d) => {
                    d.push('\n');
                    d.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    if event.is_none() && data.is_none() {
        return None;
    }
    Some(SseFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.unwrap_or_default(),
    })
}
