//! Response-processing pipeline.
//!
//! Each upstream response is wired into a graph of transforms (may rewrite
//! bytes and headers), taps (observe only) and a terminal sink. Terminal
//! handling is guarded by a latch so that `end`, `error` and `close` firing
//! in any order and multiplicity finalise the flow exactly once.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;
use tracing::{debug, warn};
use wiretap_core::error::ProxyError;
use wiretap_core::flow::{Flow, FlowId, FlowResponse, Headers};
use wiretap_core::storage::FlowStore;

use crate::http1::{ResponseHead, ResponseReader};
use crate::sink::ResponseSink;

/// Header rewrites requested by a transform.
#[derive(Debug, Default, Clone)]
pub struct HeaderMods {
    pub remove: Vec<String>,
    pub set: Vec<(String, String)>,
}

impl HeaderMods {
    pub fn apply(&self, headers: &mut Headers) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.set(name, value.clone());
        }
    }
}

/// Read-mostly descriptor of the response being processed.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub flow_id: FlowId,
    pub status: u16,
    pub reason: String,
    /// Upstream response headers as received, names lowercased.
    pub headers: Headers,
    /// Media type, lowercased, parameters stripped.
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Whether the upstream framed the body as chunked.
    pub chunked_upstream: bool,
    pub is_streaming: bool,
    pub store_raw_http: bool,
    pub verbose: bool,
}

impl ResponseMeta {
    pub fn from_head(
        flow_id: FlowId,
        head: &ResponseHead,
        store_raw_http: bool,
        verbose: bool,
    ) -> Self {
        let content_type = head
            .headers
            .get("content-type")
            .map(|v| media_type(v).to_owned());
        let content_encoding = head
            .headers
            .get("content-encoding")
            .map(|v| v.trim().to_ascii_lowercase());
        let chunked_upstream = head
            .headers
            .get_all("transfer-encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        let is_streaming = content_type
            .as_deref()
            .is_some_and(is_streaming_content_type);

        Self {
            flow_id,
            status: head.status,
            reason: head.reason.clone(),
            headers: head.headers.clone(),
            content_type,
            content_encoding,
            chunked_upstream,
            is_streaming,
            store_raw_http,
            verbose,
        }
    }
}

/// Media type of a content-type value: lowercased, parameters stripped.
pub fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub fn is_streaming_content_type(media_type: &str) -> bool {
    matches!(
        media_type,
        "text/event-stream" | "application/vnd.amazon.eventstream"
    )
}

/// A pipeline stage that may buffer and rewrite bytes and headers.
pub trait Transform: Send {
    fn should_activate(&self, meta: &ResponseMeta) -> bool;

    /// Whether this stage needs the whole body before it can produce output.
    fn buffers(&self, _meta: &ResponseMeta) -> bool {
        false
    }

    /// Process one chunk; `None` means the stage consumed it.
    fn process(&mut self, chunk: Bytes, meta: &ResponseMeta) -> Option<Bytes>;

    /// Produce any output held back at end of stream.
    fn flush(&mut self, meta: &ResponseMeta) -> Option<Bytes>;

    /// Header rewrites to apply when response headers are emitted.
    fn header_mods(&self, meta: &ResponseMeta) -> HeaderMods;

    /// True when the stage gave up and passed bytes through unchanged.
    fn failed(&self) -> bool {
        false
    }
}

/// A pipeline observer. Tap failures are logged and never abort the response.
pub trait Tap: Send {
    fn should_activate(&self, meta: &ResponseMeta) -> bool;

    fn on_chunk(&mut self, chunk: &Bytes, meta: &ResponseMeta) -> Result<(), ProxyError>;

    fn on_end(&mut self, flow: &mut Flow, meta: &ResponseMeta) -> Result<(), ProxyError>;

    fn on_error(
        &mut self,
        error: &str,
        flow: &mut Flow,
        meta: &ResponseMeta,
    ) -> Result<(), ProxyError>;
}

/// Which terminal signal finalised the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Upstream body completed normally.
    End,
    /// Upstream read failed mid-response.
    Error,
    /// The downstream client went away.
    Close,
}

pub struct ResponsePipeline<S: ResponseSink> {
    flow: Flow,
    meta: ResponseMeta,
    store: Arc<dyn FlowStore>,
    transforms: Vec<Box<dyn Transform>>,
    taps: Vec<Box<dyn Tap>>,
    sink: S,
    started: Instant,
    buffering: bool,
    buffer: BytesMut,
    headers_sent: bool,
    finished: bool,
}

impl<S: ResponseSink> ResponsePipeline<S> {
    /// Wire a response into its processing graph.
    ///
    /// Persists the headers-known flow state, and emits response headers
    /// immediately unless a stage requires whole-body buffering.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        mut flow: Flow,
        meta: ResponseMeta,
        store: Arc<dyn FlowStore>,
        transforms: Vec<Box<dyn Transform>>,
        taps: Vec<Box<dyn Tap>>,
        mut sink: S,
        started: Instant,
    ) -> Result<Self, ProxyError> {
        let transforms: Vec<_> = transforms
            .into_iter()
            .filter(|t| t.should_activate(&meta))
            .collect();
        let taps: Vec<_> = taps
            .into_iter()
            .filter(|t| t.should_activate(&meta))
            .collect();

        // The raw-HTTP snapshot needs a correct content-length, which cannot
        // be reconstructed from a chunked stream without accumulating it.
        let buffering = transforms.iter().any(|t| t.buffers(&meta))
            || (meta.store_raw_http && meta.chunked_upstream);

        flow.is_stream = meta.is_streaming;

        let mut headers_sent = false;
        let response_headers = if buffering {
            meta.headers.clone()
        } else {
            let mut headers = meta.headers.clone();
            for t in &transforms {
                t.header_mods(&meta).apply(&mut headers);
            }
            headers.remove("transfer-encoding");
            // Live streams without a length are delimited by connection close.
            if meta.is_streaming && !headers.contains("content-length") {
                headers.set("connection", "close");
            }
            sink.write_head(meta.status, &meta.reason, &headers).await?;
            headers_sent = true;
            headers
        };

        flow.response = Some(FlowResponse {
            status: meta.status,
            status_text: meta.reason.clone(),
            headers: response_headers,
            body: None,
            duration_ms: 0,
        });
        store.save_flow(&flow)?;

        Ok(Self {
            flow,
            meta,
            store,
            transforms,
            taps,
            sink,
            started,
            buffering,
            buffer: BytesMut::new(),
            headers_sent,
            finished: false,
        })
    }

    /// Feed one upstream chunk through transforms, taps and the sink.
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), ProxyError> {
        if self.finished {
            return Ok(());
        }
        if self.buffering {
            self.buffer.extend_from_slice(&chunk);
            return Ok(());
        }

        let mut data = chunk;
        for t in &mut self.transforms {
            match t.process(data, &self.meta) {
                Some(out) => data = out,
                None => return Ok(()),
            }
        }
        if data.is_empty() {
            return Ok(());
        }
        self.tap_chunk(&data);
        self.sink.write(data).await?;
        Ok(())
    }

    /// Idempotently finalise the response.
    ///
    /// Safe to call for every terminal signal; only the first call acts.
    pub async fn finish(
        &mut self,
        reason: FinishReason,
        error: Option<&str>,
    ) -> Result<(), ProxyError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let data = if self.buffering {
            let mut data = self.buffer.split().freeze();
            for i in 0..self.transforms.len() {
                let processed = self.transforms[i].process(data.clone(), &self.meta);
                let flushed = self.transforms[i].flush(&self.meta);
                if let Some(out) = flushed.or(processed) {
                    data = out;
                }
            }
            data
        } else {
            // Flush carried state, routing it through the rest of the chain.
            let mut data = BytesMut::new();
            for i in 0..self.transforms.len() {
                let (head, tail) = self.transforms.split_at_mut(i + 1);
                if let Some(mut out) = head[i].flush(&self.meta) {
                    let mut consumed = false;
                    for t in tail {
                        match t.process(out.clone(), &self.meta) {
                            Some(next) => out = next,
                            None => {
                                consumed = true;
                                break;
                            }
                        }
                    }
                    if !consumed {
                        data.extend_from_slice(&out);
                    }
                }
            }
            data.freeze()
        };

        if !self.headers_sent {
            let headers = self.final_headers(data.len());
            if let Err(e) = self
                .sink
                .write_head(self.meta.status, &self.meta.reason, &headers)
                .await
            {
                debug!("client rejected response headers during finalisation: {e}");
            }
            self.headers_sent = true;
            if let Some(response) = &mut self.flow.response {
                response.headers = headers;
            }
        }

        if !data.is_empty() {
            self.tap_chunk(&data);
            // Best-effort delivery; the client may already be gone.
            if let Err(e) = self.sink.write(data).await {
                debug!("client write failed during finalisation: {e}");
            }
        }

        let message = error.unwrap_or(match reason {
            FinishReason::Error => "upstream stream error",
            FinishReason::Close => "connection closed prematurely",
            FinishReason::End => "",
        });
        for tap in &mut self.taps {
            let result = match reason {
                FinishReason::End => tap.on_end(&mut self.flow, &self.meta),
                _ => tap.on_error(message, &mut self.flow, &self.meta),
            };
            if let Err(e) = result {
                warn!("tap failed during finalisation: {e}");
            }
        }

        if let Some(response) = &mut self.flow.response {
            response.duration_ms = self.started.elapsed().as_millis() as u64;
        }
        if let Err(e) = self.store.save_flow(&self.flow) {
            warn!("terminal flow save failed: {e}");
        }
        if let Err(e) = self.sink.end().await {
            debug!("sink close failed: {e}");
        }
        Ok(())
    }

    fn final_headers(&self, body_len: usize) -> Headers {
        let mut headers = self.meta.headers.clone();
        let mut failed = false;
        for t in &self.transforms {
            t.header_mods(&self.meta).apply(&mut headers);
            failed = failed || t.failed();
        }
        headers.remove("transfer-encoding");
        let bodyless_status = self.meta.status == 204 || self.meta.status == 304;
        if !failed && !bodyless_status {
            headers.set("content-length", body_len.to_string());
        }
        headers
    }

    fn tap_chunk(&mut self, data: &Bytes) {
        for tap in &mut self.taps {
            if let Err(e) = tap.on_chunk(data, &self.meta) {
                warn!("tap failed on chunk: {e}");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn sink_closed(&self) -> bool {
        self.sink.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn sink(&self) -> &S {
        &self.sink
    }
}

/// Pump an upstream body into a pipeline until one of the three terminal
/// signals fires, then finalise.
pub async fn drive<R, S>(
    reader: &mut ResponseReader<R>,
    pipeline: &mut ResponsePipeline<S>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    S: ResponseSink,
{
    loop {
        match reader.next_chunk().await {
            Ok(Some(chunk)) => {
                if let Err(e) = pipeline.write(chunk).await {
                    debug!("client write failed mid-response: {e}");
                    pipeline
                        .finish(FinishReason::Close, Some(&e.to_string()))
                        .await?;
                    return Ok(());
                }
            }
            Ok(None) => {
                pipeline.finish(FinishReason::End, None).await?;
                return Ok(());
            }
            Err(e) => {
                pipeline
                    .finish(FinishReason::Error, Some(&e.to_string()))
                    .await?;
                return Ok(());
            }
        }
    }
}

/// Write a synthetic `502 Bad Gateway` carrying the error text, and record
/// the terminal flow state.
pub async fn synthesize_502<S: ResponseSink>(
    sink: &mut S,
    flow: &mut Flow,
    store: &Arc<dyn FlowStore>,
    message: &str,
) {
    let mut headers = Headers::new();
    headers.set("content-type", "text/plain");
    headers.set("content-length", message.len().to_string());
    headers.set("connection", "close");

    flow.response = Some(FlowResponse {
        status: 502,
        status_text: "Bad Gateway".into(),
        headers: headers.clone(),
        body: Some(message.to_string()),
        duration_ms: 0,
    });
    if let Err(e) = store.save_flow(flow) {
        warn!("failed to save 502 flow: {e}");
    }

    let _ = sink.write_head(502, "Bad Gateway", &headers).await;
    let _ = sink.write(Bytes::copy_from_slice(message.as_bytes())).await;
    let _ = sink.end().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BufferSink;
    use crate::taps::standard_stages;
    use crate::testutil::{MemStore, basic_meta};
    use std::io::Write as _;
    use wiretap_core::flow::{FlowKind, FlowRequest};

    fn make_flow() -> Flow {
        Flow::new(
            FlowKind::TlsHttp,
            "example.com",
            FlowRequest {
                method: "GET".into(),
                url: "https://example.com/data".into(),
                path: "/data".into(),
                headers: Headers::new(),
                body: None,
            },
        )
    }

    async fn start_pipeline(
        store: &Arc<MemStore>,
        flow: Flow,
        meta: ResponseMeta,
    ) -> ResponsePipeline<BufferSink> {
        let store_dyn: Arc<dyn FlowStore> = store.clone();
        let (transforms, taps) = standard_stages(&store_dyn, &flow.id);
        ResponsePipeline::start(
            flow,
            meta,
            store_dyn,
            transforms,
            taps,
            BufferSink::new(),
            Instant::now(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn plain_response_is_one_head_one_write_one_end() {
        let store = Arc::new(MemStore::default());
        let flow = make_flow();
        let flow_id = flow.id.clone();
        let mut meta = basic_meta();
        meta.flow_id = flow_id.clone();
        meta.headers.push("content-type", "text/plain");
        meta.headers.push("content-length", "11");

        let mut pipeline = start_pipeline(&store, flow, meta).await;
        pipeline.write(Bytes::from_static(b"Hello World")).await.unwrap();
        pipeline.finish(FinishReason::End, None).await.unwrap();

        let sink = pipeline.sink();
        assert_eq!(sink.head_writes, 1);
        assert_eq!(sink.chunk_writes, 1);
        assert_eq!(sink.end_calls, 1);
        assert_eq!(sink.status.as_ref().unwrap().0, 200);
        assert_eq!(sink.body, b"Hello World");

        let flow = store.flow(&flow_id).unwrap();
        assert_eq!(
            flow.response.unwrap().body.as_deref(),
            Some("Hello World")
        );
    }

    #[tokio::test]
    async fn duplicate_terminal_signals_finalise_once() {
        let store = Arc::new(MemStore::default());
        let flow = make_flow();
        let flow_id = flow.id.clone();
        let mut meta = basic_meta();
        meta.flow_id = flow_id.clone();

        let mut pipeline = start_pipeline(&store, flow, meta).await;
        pipeline.write(Bytes::from_static(b"x")).await.unwrap();
        let saves_before_terminal = store.saves_for(&flow_id);

        pipeline.finish(FinishReason::End, None).await.unwrap();
        pipeline.finish(FinishReason::Error, Some("late error")).await.unwrap();
        pipeline.finish(FinishReason::Close, None).await.unwrap();
        pipeline.finish(FinishReason::End, None).await.unwrap();

        assert_eq!(store.saves_for(&flow_id), saves_before_terminal + 1);
        assert_eq!(pipeline.sink().end_calls, 1);
        // Writes after the latch are dropped.
        pipeline.write(Bytes::from_static(b"late")).await.unwrap();
        assert_eq!(pipeline.sink().body, b"x");
    }

    #[tokio::test]
    async fn status_204_with_zero_chunks_closes_immediately() {
        let store = Arc::new(MemStore::default());
        let flow = make_flow();
        let mut meta = basic_meta();
        meta.flow_id = flow.id.clone();
        meta.status = 204;
        meta.reason = "No Content".into();
        meta.content_type = None;

        let mut pipeline = start_pipeline(&store, flow, meta).await;
        pipeline.finish(FinishReason::End, None).await.unwrap();

        let sink = pipeline.sink();
        assert_eq!(sink.head_writes, 1);
        assert_eq!(sink.chunk_writes, 0);
        assert_eq!(sink.end_calls, 1);
    }

    #[tokio::test]
    async fn gzip_response_is_delivered_decoded_with_recomputed_length() {
        let store = Arc::new(MemStore::default());
        let flow = make_flow();
        let flow_id = flow.id.clone();

        let body = br#"{"status":"ok"}"#;
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(body).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut meta = basic_meta();
        meta.flow_id = flow_id.clone();
        meta.content_type = Some("application/json".into());
        meta.content_encoding = Some("gzip".into());
        meta.headers.push("content-type", "application/json");
        meta.headers.push("content-encoding", "gzip");
        meta.headers.push("content-length", compressed.len().to_string());

        let mut pipeline = start_pipeline(&store, flow, meta).await;
        // Feed in two pieces; buffering hides the split.
        let (a, b) = compressed.split_at(compressed.len() / 2);
        pipeline.write(Bytes::copy_from_slice(a)).await.unwrap();
        pipeline.write(Bytes::copy_from_slice(b)).await.unwrap();
        // Headers must not be written until the body is decodable.
        assert_eq!(pipeline.sink().head_writes, 0);
        pipeline.finish(FinishReason::End, None).await.unwrap();

        let sink = pipeline.sink();
        assert_eq!(sink.status.as_ref().unwrap().0, 200);
        assert_eq!(sink.body, body);
        assert!(sink.headers.get("content-encoding").is_none());
        assert_eq!(sink.headers.get("content-length"), Some("15"));

        let flow = store.flow(&flow_id).unwrap();
        assert_eq!(
            flow.response.unwrap().body.as_deref(),
            Some(r#"{"status":"ok"}"#)
        );
    }

    #[tokio::test]
    async fn chunked_upstream_never_forwards_transfer_encoding() {
        let store = Arc::new(MemStore::default());
        let flow = make_flow();
        let mut meta = basic_meta();
        meta.flow_id = flow.id.clone();
        meta.headers.push("transfer-encoding", "chunked");
        meta.chunked_upstream = true;

        let mut pipeline = start_pipeline(&store, flow, meta).await;
        pipeline.write(Bytes::from_static(b"streamed")).await.unwrap();
        pipeline.finish(FinishReason::End, None).await.unwrap();

        let sink = pipeline.sink();
        assert!(sink.headers.get("transfer-encoding").is_none());
        assert_eq!(sink.body, b"streamed");
    }

    #[tokio::test]
    async fn raw_capture_of_chunked_upstream_buffers_for_content_length() {
        let store = Arc::new(MemStore::default());
        let flow = make_flow();
        let flow_id = flow.id.clone();
        store
            .init_raw_http(&flow_id, "GET /data HTTP/1.1\r\n\r\n")
            .unwrap();

        let mut meta = basic_meta();
        meta.flow_id = flow_id.clone();
        meta.headers.push("transfer-encoding", "chunked");
        meta.chunked_upstream = true;
        meta.store_raw_http = true;

        let mut pipeline = start_pipeline(&store, flow, meta).await;
        pipeline.write(Bytes::from_static(b"part one, ")).await.unwrap();
        // Buffering defers header emission until the length is known.
        assert_eq!(pipeline.sink().head_writes, 0);
        pipeline.write(Bytes::from_static(b"part two")).await.unwrap();
        pipeline.finish(FinishReason::End, None).await.unwrap();

        let sink = pipeline.sink();
        assert_eq!(sink.headers.get("content-length"), Some("18"));
        assert!(sink.headers.get("transfer-encoding").is_none());

        let raw = store.get_raw_http(&flow_id).unwrap().unwrap();
        let response = raw.response.unwrap();
        assert!(response.contains("content-length: 18\r\n"));
        assert!(response.ends_with("part one, part two"));
    }

    #[tokio::test]
    async fn streaming_headers_gain_connection_close() {
        let store = Arc::new(MemStore::default());
        let flow = make_flow();
        let flow_id = flow.id.clone();
        let mut meta = basic_meta();
        meta.flow_id = flow_id.clone();
        meta.content_type = Some("text/event-stream".into());
        meta.is_streaming = true;
        meta.headers.push("content-type", "text/event-stream");

        let mut pipeline = start_pipeline(&store, flow, meta).await;
        // Headers go out before any data for live streams.
        assert_eq!(pipeline.sink().head_writes, 1);
        assert_eq!(pipeline.sink().headers.get("connection"), Some("close"));

        pipeline
            .write(Bytes::from_static(b"data: {\"msg\":\"1\"}\n\n"))
            .await
            .unwrap();
        pipeline.finish(FinishReason::End, None).await.unwrap();

        assert!(store.flow(&flow_id).unwrap().is_stream);
        assert_eq!(store.get_events(&flow_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tap_failures_do_not_abort_the_response() {
        struct ExplodingTap;

        impl Tap for ExplodingTap {
            fn should_activate(&self, _meta: &ResponseMeta) -> bool {
                true
            }

            fn on_chunk(&mut self, _chunk: &Bytes, _meta: &ResponseMeta) -> Result<(), ProxyError> {
                Err(ProxyError::Http("tap blew up".into()))
            }

            fn on_end(&mut self, _flow: &mut Flow, _meta: &ResponseMeta) -> Result<(), ProxyError> {
                Err(ProxyError::Http("tap blew up again".into()))
            }

            fn on_error(
                &mut self,
                _error: &str,
                _flow: &mut Flow,
                _meta: &ResponseMeta,
            ) -> Result<(), ProxyError> {
                Ok(())
            }
        }

        let store = Arc::new(MemStore::default());
        let store_dyn: Arc<dyn FlowStore> = store.clone();
        let flow = make_flow();
        let mut meta = basic_meta();
        meta.flow_id = flow.id.clone();

        let mut pipeline = ResponsePipeline::start(
            flow,
            meta,
            store_dyn,
            Vec::new(),
            vec![Box::new(ExplodingTap)],
            BufferSink::new(),
            Instant::now(),
        )
        .await
        .unwrap();

        pipeline.write(Bytes::from_static(b"survives")).await.unwrap();
        pipeline.finish(FinishReason::End, None).await.unwrap();
        assert_eq!(pipeline.sink().body, b"survives");
        assert_eq!(pipeline.sink().end_calls, 1);
    }

    #[tokio::test]
    async fn upstream_error_persists_partial_body() {
        let store = Arc::new(MemStore::default());
        let flow = make_flow();
        let flow_id = flow.id.clone();
        let mut meta = basic_meta();
        meta.flow_id = flow_id.clone();

        let mut pipeline = start_pipeline(&store, flow, meta).await;
        pipeline.write(Bytes::from_static(b"partial")).await.unwrap();
        pipeline
            .finish(FinishReason::Error, Some("connection reset"))
            .await
            .unwrap();

        let flow = store.flow(&flow_id).unwrap();
        assert_eq!(flow.response.unwrap().body.as_deref(), Some("partial"));
    }
}
