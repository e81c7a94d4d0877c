//! Server-sent-event byte framing for streaming chat responses.
//!
//! Network reads are not frame-aligned, so the decoder keeps a growable
//! buffer and cuts frames at blank-line delimiters wherever the chunk
//! boundaries happen to fall.

/// One framed server-sent event: optional event name plus joined data lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE framer fed by arbitrarily-sized byte chunks.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every frame it completes, in order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((frame_end, delimiter_len)) = find_frame_delimiter(&self.buffer) {
            let frame_bytes = self.buffer[..frame_end].to_vec();
            self.buffer.drain(..frame_end + delimiter_len);
            if let Some(frame) = parse_sse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes buffered trailing bytes as a final frame when the connection
    /// closes without a terminating blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let trailing = std::mem::take(&mut self.buffer);
        parse_sse_frame(&trailing)
    }
}

fn find_frame_delimiter(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == b'\n' && buffer[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buffer.len()
            && buffer[i] == b'\r'
            && buffer[i + 1] == b'\n'
            && buffer[i + 2] == b'\r'
            && buffer[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::{SseFrame, SseFrameDecoder};

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn unit_push_chunk_decodes_complete_frames_in_order() {
        let mut decoder = SseFrameDecoder::new();
        let frames = decoder.push_chunk(b"data: one\n\ndata: two\n\n");
        assert_eq!(frames, vec![frame("one"), frame("two")]);
    }

    #[test]
    fn unit_partial_frames_wait_for_more_bytes() {
        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.push_chunk(b"data: hel").is_empty());
        assert!(decoder.push_chunk(b"lo\n").is_empty());
        let frames = decoder.push_chunk(b"\n");
        assert_eq!(frames, vec![frame("hello")]);
    }

    #[test]
    fn unit_crlf_delimited_frames_decode() {
        let mut decoder = SseFrameDecoder::new();
        let frames = decoder.push_chunk(b"event: message\r\ndata: {\"x\":1}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, "{\"x\":1}");
    }

    #[test]
    fn unit_comment_lines_are_skipped() {
        let mut decoder = SseFrameDecoder::new();
        let frames = decoder.push_chunk(b": heartbeat\n\ndata: real\n\n");
        assert_eq!(frames, vec![frame("real")]);
    }

    #[test]
    fn functional_chunk_boundaries_never_change_the_frame_sequence() {
        let stream = b"data: {\"a\":1}\n\n: keepalive\n\ndata: {\"b\":2}\r\n\r\ndata: [DONE]\n\n";
        let mut whole = SseFrameDecoder::new();
        let expected = whole.push_chunk(stream);

        for split in 0..stream.len() {
            let mut decoder = SseFrameDecoder::new();
            let mut frames = decoder.push_chunk(&stream[..split]);
            frames.extend(decoder.push_chunk(&stream[split..]));
            assert_eq!(frames, expected, "split at byte {split} diverged");
        }
    }

    #[test]
    fn regression_finish_flushes_unterminated_trailing_frame() {
        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.push_chunk(b"data: tail-frame").is_empty());
        assert_eq!(decoder.finish(), Some(frame("tail-frame")));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn regression_multiple_data_lines_join_with_newline() {
        let mut decoder = SseFrameDecoder::new();
        let frames = decoder.push_chunk(b"data: first\ndata: second\n\n");
        assert_eq!(frames, vec![frame("first\nsecond")]);
    }
}
