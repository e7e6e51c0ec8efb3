//! Terminal consumers of a response stream.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use wiretap_core::flow::Headers;

/// Terminal consumer of one response.
///
/// `write_head` is accepted at most once; `end` is idempotent.
#[async_trait]
pub trait ResponseSink: Send {
    async fn write_head(
        &mut self,
        status: u16,
        reason: &str,
        headers: &Headers,
    ) -> std::io::Result<()>;

    async fn write(&mut self, chunk: Bytes) -> std::io::Result<()>;

    async fn end(&mut self) -> std::io::Result<()>;

    /// Whether `end` tore down the underlying connection.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Sink writing wire-format HTTP/1.1 to the downstream client socket.
///
/// Bodies are always identity-framed: the response is delimited either by
/// `content-length` or by closing the connection at `end`.
pub struct ClientSink<W> {
    writer: W,
    headers_sent: bool,
    ended: bool,
    close_on_end: bool,
}

impl<W: AsyncWrite + Unpin + Send> ClientSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            headers_sent: false,
            ended: false,
            close_on_end: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseSink for ClientSink<W> {
    async fn write_head(
        &mut self,
        status: u16,
        reason: &str,
        headers: &Headers,
    ) -> std::io::Result<()> {
        if self.headers_sent {
            return Err(std::io::Error::other("response headers already written"));
        }
        self.headers_sent = true;

        // Without a content-length the client can only detect the end of the
        // body by reading to FIN.
        self.close_on_end = !headers.contains("content-length")
            || headers
                .get_all("connection")
                .any(|v| v.eq_ignore_ascii_case("close"));

        let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
        for (name, value) in headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.writer.write_all(head.as_bytes()).await?;
        self.writer.flush().await
    }

    async fn write(&mut self, chunk: Bytes) -> std::io::Result<()> {
        self.writer.write_all(&chunk).await?;
        self.writer.flush().await
    }

    async fn end(&mut self) -> std::io::Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        self.writer.flush().await?;
        if self.close_on_end {
            self.writer.shutdown().await?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.ended && self.close_on_end
    }
}

/// Captures status, headers and bytes in memory, for replay and tests.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub status: Option<(u16, String)>,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub head_writes: usize,
    pub chunk_writes: usize,
    pub end_calls: usize,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseSink for BufferSink {
    async fn write_head(
        &mut self,
        status: u16,
        reason: &str,
        headers: &Headers,
    ) -> std::io::Result<()> {
        if self.status.is_some() {
            return Err(std::io::Error::other("response headers already written"));
        }
        self.head_writes += 1;
        self.status = Some((status, reason.to_string()));
        self.headers = headers.clone();
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> std::io::Result<()> {
        self.chunk_writes += 1;
        self.body.extend_from_slice(&chunk);
        Ok(())
    }

    async fn end(&mut self) -> std::io::Result<()> {
        self.end_calls += 1;
        Ok(())
    }
}

/// Composite sink over N sub-sinks.
///
/// The first sub-sink receives the original chunk; the rest receive byte-wise
/// copies so no downstream sink can observe another's buffer.
pub struct TeeSink {
    sinks: Vec<Box<dyn ResponseSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Box<dyn ResponseSink>>) -> Self {
        Self { sinks }
    }

    pub fn into_sinks(self) -> Vec<Box<dyn ResponseSink>> {
        self.sinks
    }
}

#[async_trait]
impl ResponseSink for TeeSink {
    async fn write_head(
        &mut self,
        status: u16,
        reason: &str,
        headers: &Headers,
    ) -> std::io::Result<()> {
        for sink in &mut self.sinks {
            sink.write_head(status, reason, headers).await?;
        }
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> std::io::Result<()> {
        let mut iter = self.sinks.iter_mut();
        if let Some(first) = iter.next() {
            for sink in iter {
                sink.write(Bytes::copy_from_slice(&chunk)).await?;
            }
            first.write(chunk).await?;
        }
        Ok(())
    }

    async fn end(&mut self) -> std::io::Result<()> {
        for sink in &mut self.sinks {
            sink.end().await?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.sinks.first().is_some_and(|s| s.is_closed())
    }
}
