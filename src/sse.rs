//! Framing for the backend's `text/event-stream` channel.
//!
//! Lines starting with `data:` carry payload fragments. Fragments are
//! trimmed and concatenated until a blank line terminates the event, at
//! which point the joined text is handed to the [decoder](crate::decoder)
//! as one unit. Other field lines (`event:`, `id:`, `retry:`) and comments
//! (`:` prefix) are skipped.
//!
//! [`SseFrameDecoder`] is transport-independent: feed it raw byte chunks as
//! they arrive from the network, or whole lines if the transport already
//! splits them.

/// Prefix of a line carrying a payload fragment.
pub const DATA_PREFIX: &str = "data:";

/// Incremental event-stream frame splitter.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    /// Bytes of a line that has not been terminated yet.
    pending: Vec<u8>,
    /// Concatenated `data:` fragments of the current event.
    data: String,
    has_data: bool,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one complete line (without its terminator).
    ///
    /// Returns the finished event text when `line` is the blank terminator
    /// of an event that carried at least one `data:` line.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.take_frame();
        }
        if let Some(fragment) = line.strip_prefix(DATA_PREFIX) {
            self.data.push_str(fragment.trim());
            self.has_data = true;
        }
        None
    }

    /// Feed a raw chunk of bytes. Returns every event completed by it.
    ///
    /// Lines may be split across chunks at any byte, including inside a
    /// multi-byte UTF-8 sequence.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = raw.strip_suffix(b"\n").unwrap_or(raw.as_slice());
            let line = String::from_utf8_lossy(line);
            if let Some(frame) = self.push_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Feed a text chunk. Same as [`push_bytes`](Self::push_bytes).
    pub fn push_chunk(&mut self, chunk: &str) -> Vec<String> {
        self.push_bytes(chunk.as_bytes())
    }

    /// Flush at end of stream: an unterminated trailing line is processed
    /// and an event missing its blank terminator is still emitted.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(frame) = self.push_line(&line) {
                return Some(frame);
            }
        }
        self.take_frame()
    }

    fn take_frame(&mut self) -> Option<String> {
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        let frame = std::mem::take(&mut self.data);
        if frame.is_empty() {
            None
        } else {
            Some(frame)
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn single_line_event() {
        let mut decoder = SseFrameDecoder::new();
        assert_eq!(decoder.push_line(r#"data: {"cmd":"test"}"#), None);
        assert_eq!(decoder.push_line(""), Some(r#"{"cmd":"test"}"#.to_string()));
    }

    #[test]
    fn multi_line_fragments_are_concatenated() {
        let mut decoder = SseFrameDecoder::new();
        decoder.push_line(r#"data: {"cmd":"drMemberCPGateArray","#);
        decoder.push_line(r#"data:  "payload":{"list":[]}}"#);
        let frame = decoder.push_line("").unwrap();
        assert_eq!(frame, r#"{"cmd":"drMemberCPGateArray","payload":{"list":[]}}"#);
    }

    #[test]
    fn non_data_fields_and_comments_are_skipped() {
        let mut decoder = SseFrameDecoder::new();
        decoder.push_line(": keep-alive");
        decoder.push_line("event: message");
        decoder.push_line("id: 42");
        decoder.push_line("data: hello");
        assert_eq!(decoder.push_line(""), Some("hello".to_string()));
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        let mut decoder = SseFrameDecoder::new();
        assert_eq!(decoder.push_line(""), None);
        decoder.push_line(": comment");
        assert_eq!(decoder.push_line(""), None);
        decoder.push_line("data:");
        assert_eq!(decoder.push_line(""), None);
    }

    #[test]
    fn crlf_terminators_are_handled() {
        let mut decoder = SseFrameDecoder::new();
        let frames = decoder.push_chunk("data: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(frames, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn chunks_split_mid_line_and_mid_character() {
        let text = "data: {\"name\":\"Jos\u{e9}\"}\n\n".as_bytes().to_vec();
        // Split inside the two-byte 'é'.
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.push_bytes(&text[..split]).is_empty());
        let frames = decoder.push_bytes(&text[split..]);
        assert_eq!(frames, vec!["{\"name\":\"Jos\u{e9}\"}".to_string()]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.push_chunk("data: tail").is_empty());
        assert_eq!(decoder.finish(), Some("tail".to_string()));
        assert_eq!(decoder.finish(), None);
    }
}
