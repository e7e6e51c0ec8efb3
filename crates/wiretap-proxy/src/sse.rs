//! Incremental text event-stream parser.
//!
//! Accepts arbitrarily chunked bytes and yields one [`SseEvent`] per blank
//! line. All three line terminators (`\r\n`, `\n`, `\r`) are honoured because
//! upstream servers mix them.

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the stream did not name one.
    pub name: String,
    /// Data lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

#[derive(Default)]
pub struct SseParser {
    /// Trailing bytes of an incomplete utf-8 sequence, prepended to the next chunk.
    carry: Vec<u8>,
    /// Decoded text not yet terminated by a line break.
    buf: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
    event_id: Option<String>,
    saw_field: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every event dispatched by a blank line within it.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.push_text(chunk);

        let mut out = Vec::new();
        while let Some((line, consumed)) = next_line(&self.buf) {
            let line = line.to_owned();
            self.buf.drain(..consumed);
            self.handle_line(&line, &mut out);
        }
        out
    }

    /// Drain any fully-formed event still sitting in the buffer.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();

        // At end of stream a trailing bare CR is a terminator, not the first
        // half of a CRLF.
        if self.buf.ends_with('\r') {
            self.buf.pop();
            let line = std::mem::take(&mut self.buf);
            self.handle_line(&line, &mut out);
        }
        while let Some((line, consumed)) = next_line(&self.buf) {
            let line = line.to_owned();
            self.buf.drain(..consumed);
            self.handle_line(&line, &mut out);
        }
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.handle_line(&line, &mut out);
        }
        if let Some(event) = self.take_event() {
            out.push(event);
        }
        out
    }

    fn push_text(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        match std::str::from_utf8(&bytes) {
            Ok(text) => self.buf.push_str(text),
            Err(e) if e.error_len().is_none() => {
                // Incomplete multibyte sequence at the end of the chunk.
                let valid = e.valid_up_to();
                self.buf
                    .push_str(std::str::from_utf8(&bytes[..valid]).unwrap_or_default());
                self.carry = bytes[valid..].to_vec();
            }
            Err(_) => self
                .buf
                .push_str(&String::from_utf8_lossy(&bytes)),
        }
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if let Some(event) = self.take_event() {
                out.push(event);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (name, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match name {
            "event" => {
                self.event_name = Some(value.to_owned());
                self.saw_field = true;
            }
            "data" => {
                self.data_lines.push(value.to_owned());
                self.saw_field = true;
            }
            "id" => {
                self.event_id = Some(value.to_owned());
                self.saw_field = true;
            }
            _ => {}
        }
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if !self.saw_field {
            return None;
        }
        self.saw_field = false;
        let event = SseEvent {
            name: self.event_name.take().unwrap_or_else(|| "message".into()),
            data: self.data_lines.join("\n"),
            id: self.event_id.take(),
        };
        self.data_lines.clear();
        Some(event)
    }
}

/// Next complete line and the number of bytes it consumed.
///
/// A CR at the very end of the buffer is deferred: it may be the first half
/// of a CRLF split across chunks.
fn next_line(buf: &str) -> Option<(&str, usize)> {
    let bytes = buf.as_bytes();
    let pos = bytes.iter().position(|&b| b == b'\n' || b == b'\r')?;
    if bytes[pos] == b'\n' {
        return Some((&buf[..pos], pos + 1));
    }
    if pos + 1 == bytes.len() {
        return None;
    }
    let consumed = if bytes[pos + 1] == b'\n' { pos + 2 } else { pos + 1 };
    Some((&buf[..pos], consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&str]) -> Vec<SseEvent> {
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.process(chunk.as_bytes()));
        }
        events.extend(parser.flush());
        events
    }

    #[test]
    fn single_event() {
        let events = collect(&["data: hello world\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "message");
        assert_eq!(events[0].data, "hello world");
    }

    #[test]
    fn named_event_with_id() {
        let events = collect(&["event: update\nid: 7\ndata: payload\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "update");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn multiline_data_joined_with_newlines() {
        let events = collect(&["data: a\ndata: b\ndata: c\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb\nc");
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let whole = collect(&["data: hello\n\ndata: world\n\n"]);
        let split = collect(&["data: hel", "lo\n", "\ndata:", " world\n\n"]);
        assert_eq!(whole, split);
        assert_eq!(split.len(), 2);
    }

    #[test]
    fn all_three_terminators() {
        for sep in ["\n", "\r\n", "\r"] {
            let framed = format!("data: one{sep}{sep}data: two{sep}{sep}");
            let events = collect(&[&framed]);
            assert_eq!(events.len(), 2, "terminator {sep:?}");
            assert_eq!(events[0].data, "one");
            assert_eq!(events[1].data, "two");
        }
    }

    #[test]
    fn mixed_terminators() {
        let events = collect(&["data: first\r\n\r\ndata: second\n\ndata: third\r\r"]);
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].data, "third");
    }

    #[test]
    fn crlf_split_across_chunks_is_one_terminator() {
        let events = collect(&["data: a\r", "\n\r\ndata: b\n\n"]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b");
    }

    #[test]
    fn comments_are_ignored() {
        let events = collect(&[": keep-alive\ndata: real\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn comment_only_blocks_are_suppressed() {
        let events = collect(&[": ping\n\ndata: real\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn value_space_stripping() {
        let events = collect(&["data:no-space\ndata:  two-spaces\n\n"]);
        assert_eq!(events[0].data, "no-space\n two-spaces");
    }

    #[test]
    fn flush_returns_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.process(b"data: trailing").is_empty());
        let events = parser.flush();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "trailing");
    }

    #[test]
    fn empty_stream_yields_nothing() {
        assert!(collect(&[]).is_empty());
        assert!(collect(&["\n\n\n\n"]).is_empty());
    }

    #[test]
    fn multibyte_utf8_split_across_chunks() {
        let mut parser = SseParser::new();
        let text = "data: price €99\n\n".as_bytes();
        let mut events = Vec::new();
        // Split inside the three-byte euro sign.
        events.extend(parser.process(&text[..13]));
        events.extend(parser.process(&text[13..]));
        events.extend(parser.flush());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "price €99");
    }
}
