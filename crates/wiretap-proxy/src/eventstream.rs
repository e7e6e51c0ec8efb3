//! AWS-style binary event-stream parser.
//!
//! Frame layout (big-endian):
//!
//! ```text
//! [total_len:4][headers_len:4][prelude_crc:4][headers...][payload...][msg_crc:4]
//! ```
//!
//! CRCs are not verified; interception must be lenient. An implausible
//! `total_len` re-syncs the parser by dropping one byte.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::{Buf, BytesMut};
use tracing::debug;

/// Frames shorter than the two length words, the prelude CRC and the message
/// CRC cannot exist.
const MIN_FRAME_LEN: usize = 16;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One event converted from a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryEvent {
    pub name: String,
    pub data: String,
}

/// Typed frame header values.
#[derive(Debug, Clone, PartialEq)]
enum HeaderValue {
    BoolTrue,
    BoolFalse,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Bytes(Vec<u8>),
    Str(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl HeaderValue {
    fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct EventStreamParser {
    buf: BytesMut,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every event whose frame completed within it.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<BinaryEvent> {
        self.buf.extend_from_slice(chunk);
        self.drain()
    }

    /// Drain any complete frames still in the buffer.
    pub fn flush(&mut self) -> Vec<BinaryEvent> {
        self.drain()
    }

    fn drain(&mut self) -> Vec<BinaryEvent> {
        let mut out = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let total =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total) {
                // Corrupt prelude; resynchronise one byte at a time.
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < 8 {
                break;
            }
            let headers_len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            if 12 + headers_len + 4 > total {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < total {
                break;
            }
            let frame = self.buf.split_to(total);
            out.push(convert_frame(&frame, headers_len));
        }
        out
    }
}

fn convert_frame(frame: &[u8], headers_len: usize) -> BinaryEvent {
    let headers = parse_headers(&frame[12..12 + headers_len]);
    let payload = &frame[12 + headers_len..frame.len() - 4];

    let message_type = header_str(&headers, ":message-type");
    let exception_type = header_str(&headers, ":exception-type");

    if exception_type.is_some() || message_type == Some("exception") {
        return exception_event(exception_type.or(message_type).unwrap_or("exception"), payload);
    }

    let payload_text = String::from_utf8_lossy(payload).into_owned();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&payload_text) {
        // Bedrock-style wrapping: the payload is `{"bytes":"<base64>"}` and
        // the decoded content is the actual typed event.
        if let Some(b64) = value.get("bytes").and_then(|b| b.as_str()) {
            if let Ok(decoded) = B64.decode(b64) {
                let decoded_text = String::from_utf8_lossy(&decoded).into_owned();
                if let Ok(inner) = serde_json::from_str::<serde_json::Value>(&decoded_text) {
                    let name = inner
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("message")
                        .to_owned();
                    return BinaryEvent {
                        name,
                        data: decoded_text,
                    };
                }
                return BinaryEvent {
                    name: event_name(&headers),
                    data: decoded_text,
                };
            }
            debug!("undecodable base64 bytes field in event-stream payload");
        }
    }

    BinaryEvent {
        name: event_name(&headers),
        data: payload_text,
    }
}

fn exception_event(kind: &str, payload: &[u8]) -> BinaryEvent {
    let payload_text = String::from_utf8_lossy(payload);
    let message = serde_json::from_str::<serde_json::Value>(&payload_text)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("Message"))
                .and_then(|m| m.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| payload_text.into_owned());

    let body = serde_json::json!({
        "type": "exception",
        "errorType": kind,
        "message": message,
    });
    BinaryEvent {
        name: format!("exception:{kind}"),
        data: body.to_string(),
    }
}

fn event_name(headers: &[(String, HeaderValue)]) -> String {
    header_str(headers, ":event-type")
        .unwrap_or("message")
        .to_owned()
}

fn header_str<'a>(headers: &'a [(String, HeaderValue)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, v)| v.as_str())
}

/// Decode the typed header block. An unknown value type aborts parsing for
/// the frame; headers seen so far are kept and the payload is unaffected.
fn parse_headers(mut buf: &[u8]) -> Vec<(String, HeaderValue)> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        match parse_header(buf) {
            Some((name, value, rest)) => {
                out.push((name, value));
                buf = rest;
            }
            None => break,
        }
    }
    out
}

fn parse_header(buf: &[u8]) -> Option<(String, HeaderValue, &[u8])> {
    let (&name_len, rest) = buf.split_first()?;
    let name_len = name_len as usize;
    if rest.len() < name_len {
        return None;
    }
    let name = String::from_utf8_lossy(&rest[..name_len]).into_owned();
    let rest = &rest[name_len..];

    let (&ty, rest) = rest.split_first()?;
    let (value, rest) = match ty {
        0 => (HeaderValue::BoolTrue, rest),
        1 => (HeaderValue::BoolFalse, rest),
        2 => {
            let (&b, rest) = rest.split_first()?;
            (HeaderValue::I8(b as i8), rest)
        }
        3 => {
            let (raw, rest) = take(rest, 2)?;
            (HeaderValue::I16(i16::from_be_bytes(raw.try_into().ok()?)), rest)
        }
        4 => {
            let (raw, rest) = take(rest, 4)?;
            (HeaderValue::I32(i32::from_be_bytes(raw.try_into().ok()?)), rest)
        }
        5 => {
            let (raw, rest) = take(rest, 8)?;
            (HeaderValue::I64(i64::from_be_bytes(raw.try_into().ok()?)), rest)
        }
        6 => {
            let (raw, rest) = take_prefixed(rest)?;
            (HeaderValue::Bytes(raw.to_vec()), rest)
        }
        7 => {
            let (raw, rest) = take_prefixed(rest)?;
            (HeaderValue::Str(String::from_utf8_lossy(raw).into_owned()), rest)
        }
        8 => {
            let (raw, rest) = take(rest, 8)?;
            (
                HeaderValue::Timestamp(i64::from_be_bytes(raw.try_into().ok()?)),
                rest,
            )
        }
        9 => {
            let (raw, rest) = take(rest, 16)?;
            (HeaderValue::Uuid(raw.try_into().ok()?), rest)
        }
        other => {
            debug!("unknown event-stream header type {other}, skipping rest of headers");
            return None;
        }
    };
    Some((name, value, rest))
}

fn take(buf: &[u8], n: usize) -> Option<(&[u8], &[u8])> {
    (buf.len() >= n).then(|| buf.split_at(n))
}

/// `u16` length prefix followed by that many bytes.
fn take_prefixed(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let (raw, rest) = take(buf, 2)?;
    let len = u16::from_be_bytes(raw.try_into().ok()?) as usize;
    take(rest, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_header(name: &str, value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(7);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    fn frame(headers: &[u8], payload: &[u8]) -> Vec<u8> {
        let total = 12 + headers.len() + payload.len() + 4;
        let mut out = Vec::new();
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0u8; 4]); // prelude CRC, unchecked
        out.extend_from_slice(headers);
        out.extend_from_slice(payload);
        out.extend_from_slice(&[0u8; 4]); // message CRC, unchecked
        out
    }

    #[test]
    fn single_json_frame() {
        let mut parser = EventStreamParser::new();
        let headers = string_header(":event-type", "chunk");
        let events = parser.process(&frame(&headers, br#"{"n":1}"#));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "chunk");
        assert_eq!(events[0].data, r#"{"n":1}"#);
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut parser = EventStreamParser::new();
        let bytes = frame(&string_header(":event-type", "chunk"), b"payload");

        let mut events = Vec::new();
        for piece in bytes.chunks(3) {
            events.extend(parser.process(piece));
        }
        events.extend(parser.flush());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "payload");
    }

    #[test]
    fn many_frames_in_one_chunk() {
        let mut parser = EventStreamParser::new();
        let mut bytes = Vec::new();
        for i in 0..5 {
            bytes.extend_from_slice(&frame(
                &string_header(":event-type", "chunk"),
                format!("p{i}").as_bytes(),
            ));
        }
        let events = parser.process(&bytes);
        assert_eq!(events.len(), 5);
        assert_eq!(events[4].data, "p4");
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut parser = EventStreamParser::new();
        let mut bytes = vec![0xff, 0xfe, 0x00];
        bytes.extend_from_slice(&frame(&string_header(":event-type", "chunk"), b"ok"));
        let mut events = parser.process(&bytes);
        events.extend(parser.flush());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ok");
    }

    #[test]
    fn bytes_field_unwraps_to_typed_inner_event() {
        let inner = r#"{"type":"content_block_delta","index":0}"#;
        let payload = format!(r#"{{"bytes":"{}"}}"#, B64.encode(inner));
        let mut parser = EventStreamParser::new();
        let events = parser.process(&frame(&string_header(":event-type", "chunk"), payload.as_bytes()));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "content_block_delta");
        assert_eq!(events[0].data, inner);
    }

    #[test]
    fn bytes_field_with_non_json_content() {
        let payload = format!(r#"{{"bytes":"{}"}}"#, B64.encode("plain text"));
        let mut parser = EventStreamParser::new();
        let events = parser.process(&frame(&string_header(":event-type", "chunk"), payload.as_bytes()));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "chunk");
        assert_eq!(events[0].data, "plain text");
    }

    #[test]
    fn exception_frames() {
        let mut headers = string_header(":message-type", "exception");
        headers.extend_from_slice(&string_header(":exception-type", "throttlingException"));
        let mut parser = EventStreamParser::new();
        let events = parser.process(&frame(&headers, br#"{"message":"slow down"}"#));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "exception:throttlingException");
        let body: serde_json::Value = serde_json::from_str(&events[0].data).unwrap();
        assert_eq!(body["type"], "exception");
        assert_eq!(body["errorType"], "throttlingException");
        assert_eq!(body["message"], "slow down");
    }

    #[test]
    fn exception_with_unparseable_payload_keeps_raw_text() {
        let headers = string_header(":exception-type", "internalError");
        let mut parser = EventStreamParser::new();
        let events = parser.process(&frame(&headers, b"not json"));
        let body: serde_json::Value = serde_json::from_str(&events[0].data).unwrap();
        assert_eq!(body["message"], "not json");
    }

    #[test]
    fn unknown_header_type_keeps_payload() {
        let mut headers = string_header(":event-type", "chunk");
        // type 0x42 does not exist; parsing aborts but the frame survives
        headers.push(3);
        headers.extend_from_slice(b"odd");
        headers.push(0x42);
        headers.extend_from_slice(&[1, 2, 3]);

        let mut parser = EventStreamParser::new();
        let events = parser.process(&frame(&headers, b"kept"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "chunk");
        assert_eq!(events[0].data, "kept");
    }

    #[test]
    fn typed_headers_round_trip() {
        let mut headers = Vec::new();
        headers.push(4u8);
        headers.extend_from_slice(b"flag");
        headers.push(0); // bool true
        headers.push(5u8);
        headers.extend_from_slice(b"count");
        headers.push(4); // i32
        headers.extend_from_slice(&42i32.to_be_bytes());
        headers.extend_from_slice(&string_header(":event-type", "chunk"));

        let parsed = parse_headers(&headers);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], ("flag".into(), HeaderValue::BoolTrue));
        assert_eq!(parsed[1], ("count".into(), HeaderValue::I32(42)));
    }
}
