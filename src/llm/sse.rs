// ABOUTME: Line-oriented server-sent-events decoder for streaming responses.
// ABOUTME: Reassembles lines split across network chunks and yields data payloads.

use tracing::trace;

/// A meaningful line from the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// The JSON payload of a `data:` line.
    Data(String),
    /// The `data: [DONE]` sentinel.
    Done,
}

/// Incremental decoder over raw response bytes.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across chunks decode intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = parse_line(&line[..pos]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Decode whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseFrame> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches('\r');

    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }

    let Some(data) = line.strip_prefix("data:") else {
        trace!(line, "ignoring non-data SSE line");
        return None;
    };
    let data = data.strip_prefix(' ').unwrap_or(data).trim_end();

    match data {
        "" => None,
        "[DONE]" => Some(SseFrame::Done),
        payload => Some(SseFrame::Data(payload.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> SseFrame {
        SseFrame::Data(s.to_string())
    }

    #[test]
    fn test_complete_lines() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: [DONE]\n\n");
        assert_eq!(frames, vec![data("{\"a\":1}"), data("{\"b\":2}"), SseFrame::Done]);
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"text\":").is_empty());
        assert!(decoder.push(b"\"hel").is_empty());
        assert_eq!(decoder.push(b"lo\"}\n"), vec![data("{\"text\":\"hello\"}")]);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let bytes = "data: {\"t\":\"héllo ✓\"}\n".as_bytes();
        let split = bytes.iter().position(|&b| b == 0xc3).unwrap() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(decoder.push(&bytes[split..]), vec![data("{\"t\":\"héllo ✓\"}")]);
    }

    #[test]
    fn test_crlf_and_ignored_lines() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(
            b": keep-alive\r\nevent: response.output_text.delta\r\nid: 7\r\ndata: {\"x\":1}\r\n\r\n",
        );
        assert_eq!(frames, vec![data("{\"x\":1}")]);
    }

    #[test]
    fn test_data_without_space() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(b"data:{\"x\":1}\n"), vec![data("{\"x\":1}")]);
    }

    #[test]
    fn test_finish_flushes_trailing_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), Some(SseFrame::Done));
        assert_eq!(decoder.finish(), None);
    }
}
