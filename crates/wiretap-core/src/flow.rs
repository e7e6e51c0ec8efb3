use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Unique identifier for a captured flow (128-bit, hex-rendered).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub [u8; 16]);

impl FlowId {
    pub fn generate() -> Self {
        Self(rand_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Unique identifier for a streamed event (128-bit, hex-rendered).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub [u8; 16]);

impl EventId {
    pub fn generate() -> Self {
        Self(rand_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn rand_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    buf.iter_mut().for_each(|b| *b = rand::random());
    buf
}

/// How the exchange reached the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowKind {
    PlainHttp,
    TlsHttp,
    Websocket,
}

/// Ordered header list.
///
/// Names are stored lowercased; lookup is case-insensitive. Repeated names
/// keep their relative order, which is the only ordering that matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.push((name.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Replace all occurrences of `name` with a single entry.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.push(name, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The request half of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRequest {
    pub method: String,
    /// Absolute URL, e.g. `https://example.com/path?q=1`.
    pub url: String,
    /// Origin-form path and query.
    pub path: String,
    pub headers: Headers,
    /// Decoded (identity-framed) body, utf-8 rendered.
    pub body: Option<String>,
}

/// The response half, populated when the exchange completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    /// Decoded (identity-framed) body, utf-8 rendered.
    pub body: Option<String>,
    pub duration_ms: u64,
}

/// The canonical record of one intercepted exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub created_at: SystemTime,
    /// Upstream host this flow was dispatched to.
    pub host: String,
    pub kind: FlowKind,
    pub client_addr: Option<String>,
    pub request: FlowRequest,
    pub response: Option<FlowResponse>,
    /// Set iff the response was recognised as a streaming content type.
    pub is_stream: bool,
    /// Set iff a raw HTTP capture was requested and retained.
    pub has_raw_http: bool,
}

impl Flow {
    pub fn new(kind: FlowKind, host: impl Into<String>, request: FlowRequest) -> Self {
        Self {
            id: FlowId::generate(),
            created_at: SystemTime::now(),
            host: host.into(),
            kind,
            client_addr: None,
            request,
            response: None,
            is_stream: false,
            has_raw_http: false,
        }
    }
}

/// A parsed item from a streaming response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub flow_id: FlowId,
    /// Event name, e.g. `message` or `content_block_delta`.
    pub name: String,
    /// Payload, JSON where applicable.
    pub data: String,
    pub timestamp: SystemTime,
}

impl Event {
    pub fn new(flow_id: FlowId, name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: EventId::generate(),
            flow_id,
            name: name.into(),
            data: data.into(),
            timestamp: SystemTime::now(),
        }
    }
}

/// Canonicalised wire-format request/response strings for one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHttp {
    pub request: String,
    pub response: Option<String>,
}
