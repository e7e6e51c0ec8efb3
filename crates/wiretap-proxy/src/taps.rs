//! Pipeline observers: event parsing, flow bodies, raw HTTP capture.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};
use wiretap_core::error::ProxyError;
use wiretap_core::flow::{Event, Flow, FlowId};
use wiretap_core::storage::FlowStore;

use crate::decompress::DecompressTransform;
use crate::eventstream::EventStreamParser;
use crate::pipeline::{ResponseMeta, Tap, Transform};
use crate::sse::SseParser;

/// Raw HTTP response bodies are capped; over-cap captures keep a sentinel.
pub const RAW_CAPTURE_LIMIT: usize = 20 * 1024 * 1024;

/// The standard stage set for a dispatched response.
pub fn standard_stages(
    store: &Arc<dyn FlowStore>,
    flow_id: &FlowId,
) -> (Vec<Box<dyn Transform>>, Vec<Box<dyn Tap>>) {
    let transforms: Vec<Box<dyn Transform>> = vec![Box::new(DecompressTransform::new())];
    let taps: Vec<Box<dyn Tap>> = vec![
        Box::new(EventTap::new(store.clone(), flow_id.clone())),
        Box::new(BodyTap::new()),
        Box::new(RawHttpTap::new(store.clone(), flow_id.clone())),
    ];
    (transforms, taps)
}

enum EventParser {
    Text(SseParser),
    Binary(EventStreamParser),
}

/// Parses streaming bodies into events and hands them to storage as they
/// appear. Active only for recognised streaming content types.
pub struct EventTap {
    store: Arc<dyn FlowStore>,
    flow_id: FlowId,
    parser: Option<EventParser>,
    dead: bool,
}

impl EventTap {
    pub fn new(store: Arc<dyn FlowStore>, flow_id: FlowId) -> Self {
        Self {
            store,
            flow_id,
            parser: None,
            dead: false,
        }
    }

    fn store_events(&self, names_and_data: Vec<(String, String)>) -> Result<(), ProxyError> {
        for (name, data) in names_and_data {
            let event = Event::new(self.flow_id.clone(), name, data);
            self.store.add_event(&event)?;
        }
        Ok(())
    }

    fn parse(&mut self, chunk: &[u8]) -> Vec<(String, String)> {
        match self.parser.as_mut() {
            Some(EventParser::Text(parser)) => parser
                .process(chunk)
                .into_iter()
                .map(|e| (e.name, e.data))
                .collect(),
            Some(EventParser::Binary(parser)) => parser
                .process(chunk)
                .into_iter()
                .map(|e| (e.name, e.data))
                .collect(),
            None => Vec::new(),
        }
    }

    fn drain(&mut self) -> Vec<(String, String)> {
        match self.parser.as_mut() {
            Some(EventParser::Text(parser)) => parser
                .flush()
                .into_iter()
                .map(|e| (e.name, e.data))
                .collect(),
            Some(EventParser::Binary(parser)) => parser
                .flush()
                .into_iter()
                .map(|e| (e.name, e.data))
                .collect(),
            None => Vec::new(),
        }
    }
}

impl Tap for EventTap {
    fn should_activate(&self, meta: &ResponseMeta) -> bool {
        meta.is_streaming
    }

    fn on_chunk(&mut self, chunk: &Bytes, meta: &ResponseMeta) -> Result<(), ProxyError> {
        if self.dead {
            return Ok(());
        }
        if self.parser.is_none() {
            // Parser selection is lazy so empty streams never touch storage.
            let parser = match meta.content_type.as_deref() {
                Some("application/vnd.amazon.eventstream") => {
                    EventParser::Binary(EventStreamParser::new())
                }
                _ => EventParser::Text(SseParser::new()),
            };
            self.store.init_flow_events(&self.flow_id)?;
            self.parser = Some(parser);
        }
        let events = self.parse(chunk);
        self.store_events(events)
    }

    fn on_end(&mut self, _flow: &mut Flow, _meta: &ResponseMeta) -> Result<(), ProxyError> {
        let events = self.drain();
        self.store_events(events)
    }

    fn on_error(
        &mut self,
        error: &str,
        _flow: &mut Flow,
        _meta: &ResponseMeta,
    ) -> Result<(), ProxyError> {
        debug!("event stream ended with error: {error}");
        let events = self.drain();
        let result = self.store_events(events);
        self.parser = None;
        self.dead = true;
        result
    }
}

/// Accumulates the post-transform body into `flow.response.body`.
pub struct BodyTap {
    buf: Vec<u8>,
}

impl BodyTap {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn record(&mut self, flow: &mut Flow) {
        if self.buf.is_empty() {
            return;
        }
        if let Some(response) = &mut flow.response {
            response.body = Some(String::from_utf8_lossy(&self.buf).into_owned());
        }
    }
}

impl Default for BodyTap {
    fn default() -> Self {
        Self::new()
    }
}

impl Tap for BodyTap {
    fn should_activate(&self, _meta: &ResponseMeta) -> bool {
        true
    }

    fn on_chunk(&mut self, chunk: &Bytes, _meta: &ResponseMeta) -> Result<(), ProxyError> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn on_end(&mut self, flow: &mut Flow, _meta: &ResponseMeta) -> Result<(), ProxyError> {
        self.record(flow);
        Ok(())
    }

    fn on_error(
        &mut self,
        _error: &str,
        flow: &mut Flow,
        _meta: &ResponseMeta,
    ) -> Result<(), ProxyError> {
        // Whatever arrived before the failure is still worth keeping.
        self.record(flow);
        Ok(())
    }
}

/// Captures the canonical wire-format response for flows that requested it.
pub struct RawHttpTap {
    store: Arc<dyn FlowStore>,
    flow_id: FlowId,
    buf: Vec<u8>,
    observed: usize,
}

impl RawHttpTap {
    pub fn new(store: Arc<dyn FlowStore>, flow_id: FlowId) -> Self {
        Self {
            store,
            flow_id,
            buf: Vec::new(),
            observed: 0,
        }
    }

    fn over_cap(&self) -> bool {
        self.observed > RAW_CAPTURE_LIMIT
    }

    fn canonical_response(&self, meta: &ResponseMeta) -> String {
        let mut out = format!("HTTP/1.1 {} {}\r\n", meta.status, meta.reason);
        for (name, value) in meta.headers.iter() {
            if name == "transfer-encoding" || name == "content-length" {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if self.over_cap() {
            out.push_str(&format!("content-length: {}\r\n\r\n", self.observed));
            out.push_str(&format!(
                "[body omitted: {} bytes exceeds the 20 MiB raw capture limit]",
                self.observed
            ));
        } else {
            out.push_str(&format!("content-length: {}\r\n\r\n", self.buf.len()));
            out.push_str(&String::from_utf8_lossy(&self.buf));
        }
        out
    }
}

impl Tap for RawHttpTap {
    fn should_activate(&self, meta: &ResponseMeta) -> bool {
        meta.store_raw_http
    }

    fn on_chunk(&mut self, chunk: &Bytes, _meta: &ResponseMeta) -> Result<(), ProxyError> {
        self.observed += chunk.len();
        if self.over_cap() {
            self.buf = Vec::new();
        } else {
            self.buf.extend_from_slice(chunk);
        }
        Ok(())
    }

    fn on_end(&mut self, flow: &mut Flow, meta: &ResponseMeta) -> Result<(), ProxyError> {
        let response = self.canonical_response(meta);
        self.store.set_raw_http_response(&self.flow_id, &response)?;
        flow.has_raw_http = true;
        Ok(())
    }

    fn on_error(
        &mut self,
        error: &str,
        _flow: &mut Flow,
        _meta: &ResponseMeta,
    ) -> Result<(), ProxyError> {
        warn!("dropping raw capture for incomplete response: {error}");
        Ok(())
    }
}
