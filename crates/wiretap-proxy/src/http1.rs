//! HTTP/1.1 wire layer.
//!
//! Incremental request parsing for the client side and a streaming response
//! reader for the upstream side. Bodies always come out identity-decoded:
//! chunked framing is removed here and never travels further down the
//! pipeline. No read timeouts anywhere; long-lived event streams and
//! WebSocket connections must be allowed to idle.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use wiretap_core::error::ProxyError;
use wiretap_core::flow::Headers;

const MAX_HEADERS: usize = 64;
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent: absolute-form for proxy requests,
    /// origin-form inside tunnels, authority-form for CONNECT.
    pub target: String,
    pub headers: Headers,
    pub is_upgrade: bool,
}

#[derive(Debug)]
pub struct ParsedRequest {
    pub head: RequestHead,
    /// Identity-decoded body. Empty for upgrades; their bytes stay buffered.
    pub body: Bytes,
}

/// Incremental request parser over a byte stream.
pub struct RequestReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> RequestReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    async fn fill(&mut self) -> Result<usize, ProxyError> {
        Ok(self.reader.read_buf(&mut self.buf).await?)
    }

    /// Parse the next request off the stream.
    ///
    /// `Ok(None)` on a clean EOF between requests. Upgrade requests leave any
    /// already-received handshake bytes in the buffer; fetch them with
    /// [`take_buffered`](Self::take_buffered).
    pub async fn next_request(&mut self) -> Result<Option<ParsedRequest>, ProxyError> {
        loop {
            if let Some((head, head_len)) = parse_request_head(&self.buf)? {
                let _ = self.buf.split_to(head_len);
                let body = if head.is_upgrade {
                    Bytes::new()
                } else {
                    self.read_body(&head).await?
                };
                return Ok(Some(ParsedRequest { head, body }));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(ProxyError::Http("request head too large".into()));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Http("unexpected eof in request head".into()));
            }
        }
    }

    async fn read_body(&mut self, head: &RequestHead) -> Result<Bytes, ProxyError> {
        let chunked = head
            .headers
            .get_all("transfer-encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return self.read_chunked_body().await;
        }

        let Some(length) = head.headers.get("content-length") else {
            return Ok(Bytes::new());
        };
        let length: usize = length
            .trim()
            .parse()
            .map_err(|_| ProxyError::Http(format!("invalid content-length: {length}")))?;
        while self.buf.len() < length {
            if self.fill().await? == 0 {
                return Err(ProxyError::Http("unexpected eof in request body".into()));
            }
        }
        Ok(self.buf.split_to(length).freeze())
    }

    async fn read_chunked_body(&mut self) -> Result<Bytes, ProxyError> {
        let mut body = BytesMut::new();
        loop {
            let line = loop {
                if let Some(pos) = find_crlf(&self.buf) {
                    break self.buf.split_to(pos + 2);
                }
                if self.fill().await? == 0 {
                    return Err(ProxyError::Http("unexpected eof in chunk size".into()));
                }
            };
            let size = parse_chunk_size(&line)?;

            if size == 0 {
                // Trailer section, terminated by a blank line.
                loop {
                    match find_crlf(&self.buf) {
                        Some(0) => {
                            let _ = self.buf.split_to(2);
                            return Ok(body.freeze());
                        }
                        Some(pos) => {
                            let _ = self.buf.split_to(pos + 2);
                        }
                        None => {
                            if self.fill().await? == 0 {
                                return Err(ProxyError::Http(
                                    "unexpected eof in chunk trailers".into(),
                                ));
                            }
                        }
                    }
                }
            }

            while self.buf.len() < size + 2 {
                if self.fill().await? == 0 {
                    return Err(ProxyError::Http("unexpected eof in chunk data".into()));
                }
            }
            body.extend_from_slice(&self.buf[..size]);
            let _ = self.buf.split_to(size + 2);
        }
    }

    /// Take any bytes read past the last parsed head.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.reader, self.buf)
    }
}

fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ProxyError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let mut headers = Headers::new();
            for h in req.headers.iter() {
                headers.push(h.name, String::from_utf8_lossy(h.value).into_owned());
            }
            let is_upgrade = headers.contains("upgrade");
            Ok(Some((
                RequestHead {
                    method: req.method.unwrap_or_default().to_string(),
                    target: req.path.unwrap_or_default().to_string(),
                    headers,
                    is_upgrade,
                },
                head_len,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProxyError::Http(format!("invalid request head: {e}"))),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ProxyError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProxyError::Http("non-ascii chunk size".into()))?
        .trim_end_matches(['\r', '\n']);
    let size_part = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_part, 16)
        .map_err(|_| ProxyError::Http(format!("invalid chunk size: {size_part}")))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

pub(crate) fn contains_double_crlf(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Parsed response status line and headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

pub(crate) fn parse_response_head(
    buf: &[u8],
) -> Result<Option<(ResponseHead, usize)>, ProxyError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut header_storage);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let mut headers = Headers::new();
            for h in resp.headers.iter() {
                headers.push(h.name, String::from_utf8_lossy(h.value).into_owned());
            }
            Ok(Some((
                ResponseHead {
                    status: resp.code.unwrap_or(0),
                    reason: resp.reason.unwrap_or_default().to_string(),
                    headers,
                },
                head_len,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProxyError::Http(format!("invalid response head: {e}"))),
    }
}

#[derive(Clone, Copy)]
enum BodyFraming {
    /// No body (204, 304, 1xx, HEAD).
    None,
    Sized { remaining: usize },
    Chunked(ChunkState),
    UntilClose,
    Done,
}

#[derive(Clone, Copy)]
enum ChunkState {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
}

/// Streaming reader for upstream responses.
///
/// `read_head` parses the status line and headers; `next_chunk` then yields
/// identity-decoded body chunks as they arrive, without waiting for the body
/// to complete.
pub struct ResponseReader<R> {
    reader: R,
    buf: BytesMut,
    framing: BodyFraming,
}

impl<R: AsyncRead + Unpin> ResponseReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
            framing: BodyFraming::Done,
        }
    }

    async fn fill(&mut self) -> Result<usize, ProxyError> {
        Ok(self.reader.read_buf(&mut self.buf).await?)
    }

    pub async fn read_head(&mut self, head_request: bool) -> Result<ResponseHead, ProxyError> {
        loop {
            if let Some((head, head_len)) = parse_response_head(&self.buf)? {
                let _ = self.buf.split_to(head_len);
                self.framing = framing_for(&head, head_request);
                return Ok(head);
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(ProxyError::Http("response head too large".into()));
            }
            if self.fill().await? == 0 {
                return Err(ProxyError::Http("unexpected eof in response head".into()));
            }
        }
    }

    /// Next identity-decoded chunk of the current body; `Ok(None)` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProxyError> {
        loop {
            match self.framing {
                BodyFraming::None | BodyFraming::Done => return Ok(None),
                BodyFraming::Sized { mut remaining } => {
                    if remaining == 0 {
                        self.framing = BodyFraming::Done;
                        return Ok(None);
                    }
                    if self.buf.is_empty() && self.fill().await? == 0 {
                        self.framing = BodyFraming::Done;
                        return Err(ProxyError::Http(
                            "unexpected eof in sized response body".into(),
                        ));
                    }
                    let take = self.buf.len().min(remaining);
                    remaining -= take;
                    if remaining == 0 {
                        let chunk = self.buf.split_to(take).freeze();
                        self.framing = BodyFraming::Done;
                        return Ok(Some(chunk));
                    }
                    self.framing = BodyFraming::Sized { remaining };
                    return Ok(Some(self.buf.split_to(take).freeze()));
                }
                BodyFraming::UntilClose => {
                    if self.buf.is_empty() && self.fill().await? == 0 {
                        self.framing = BodyFraming::Done;
                        return Ok(None);
                    }
                    return Ok(Some(self.buf.split().freeze()));
                }
                BodyFraming::Chunked(state) => match state {
                    ChunkState::Size => match find_crlf(&self.buf) {
                        Some(pos) => {
                            let line = self.buf.split_to(pos + 2);
                            let size = parse_chunk_size(&line)?;
                            self.framing = BodyFraming::Chunked(if size == 0 {
                                ChunkState::Trailers
                            } else {
                                ChunkState::Data { remaining: size }
                            });
                        }
                        None => {
                            if self.fill().await? == 0 {
                                self.framing = BodyFraming::Done;
                                return Err(ProxyError::Http(
                                    "unexpected eof in chunk size".into(),
                                ));
                            }
                        }
                    },
                    ChunkState::Data { mut remaining } => {
                        if self.buf.is_empty() && self.fill().await? == 0 {
                            self.framing = BodyFraming::Done;
                            return Err(ProxyError::Http("unexpected eof in chunk data".into()));
                        }
                        let take = self.buf.len().min(remaining);
                        remaining -= take;
                        self.framing = BodyFraming::Chunked(if remaining == 0 {
                            ChunkState::DataCrlf
                        } else {
                            ChunkState::Data { remaining }
                        });
                        if take > 0 {
                            return Ok(Some(self.buf.split_to(take).freeze()));
                        }
                    }
                    ChunkState::DataCrlf => {
                        while self.buf.len() < 2 {
                            if self.fill().await? == 0 {
                                self.framing = BodyFraming::Done;
                                return Err(ProxyError::Http(
                                    "unexpected eof after chunk data".into(),
                                ));
                            }
                        }
                        let _ = self.buf.split_to(2);
                        self.framing = BodyFraming::Chunked(ChunkState::Size);
                    }
                    ChunkState::Trailers => match find_crlf(&self.buf) {
                        Some(0) => {
                            let _ = self.buf.split_to(2);
                            self.framing = BodyFraming::Done;
                            return Ok(None);
                        }
                        Some(pos) => {
                            let _ = self.buf.split_to(pos + 2);
                        }
                        None => {
                            if self.fill().await? == 0 {
                                self.framing = BodyFraming::Done;
                                return Err(ProxyError::Http(
                                    "unexpected eof in chunk trailers".into(),
                                ));
                            }
                        }
                    },
                },
            }
        }
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.reader, self.buf)
    }
}

fn framing_for(head: &ResponseHead, head_request: bool) -> BodyFraming {
    if head_request
        || head.status == 204
        || head.status == 304
        || (100..200).contains(&head.status)
    {
        return BodyFraming::None;
    }
    let chunked = head
        .headers
        .get_all("transfer-encoding")
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return BodyFraming::Chunked(ChunkState::Size);
    }
    if let Some(length) = head.headers.get("content-length") {
        if let Ok(length) = length.trim().parse::<usize>() {
            return BodyFraming::Sized { remaining: length };
        }
    }
    BodyFraming::UntilClose
}

/// Serialise and send a request, identity-framed.
///
/// `transfer-encoding` is never forwarded; `content-length` is recomputed
/// from the decoded body.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    method: &str,
    target: &str,
    headers: &Headers,
    body: &[u8],
) -> std::io::Result<()> {
    let mut head = format!("{method} {target} HTTP/1.1\r\n");
    for (name, value) in headers.iter() {
        if name == "transfer-encoding" || name == "content-length" || name == "proxy-connection" {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !body.is_empty() {
        head.push_str(&format!("content-length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    writer.flush().await
}

/// Canonical wire rendering of a parsed request, for raw capture.
pub fn canonical_request(method: &str, path: &str, headers: &Headers, body: &[u8]) -> String {
    let mut out = format!("{method} {path} HTTP/1.1\r\n");
    for (name, value) in headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(body));
    out
}

/// Read raw bytes until the end-of-headers marker is present in `buf`.
///
/// Used for WebSocket upgrade responses, which are replayed to the client
/// verbatim. Bytes past the marker stay in `buf` and must be forwarded too.
pub(crate) async fn read_head_raw<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<(), ProxyError> {
    while !contains_double_crlf(buf) {
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Http("response head too large".into()));
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(ProxyError::Http("unexpected eof in response head".into()));
        }
    }
    Ok(())
}

/// Replays a prefix before reading from the wrapped stream.
///
/// Used after CONNECT: bytes the client pipelined behind the request head
/// must reach the TLS acceptor.
pub struct Rewind<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(prefix: Bytes, inner: T) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let take = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(take));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn parses_request_with_sized_body() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = RequestReader::new(server);

        client
            .write_all(b"POST /api HTTP/1.1\r\nhost: example.com\r\ncontent-length: 5\r\n\r\nhello")
            .await
            .unwrap();

        let req = reader.next_request().await.unwrap().unwrap();
        assert_eq!(req.head.method, "POST");
        assert_eq!(req.head.target, "/api");
        assert_eq!(req.head.headers.get("host"), Some("example.com"));
        assert_eq!(&req.body[..], b"hello");
    }

    #[tokio::test]
    async fn parses_chunked_request_body() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = RequestReader::new(server);

        client
            .write_all(b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n7\r\n world!\r\n0\r\n\r\n")
            .await
            .unwrap();

        let req = reader.next_request().await.unwrap().unwrap();
        assert_eq!(&req.body[..], b"hello world!");
    }

    #[tokio::test]
    async fn sequential_requests_on_one_connection() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = RequestReader::new(server);

        client
            .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        drop(client);

        assert_eq!(reader.next_request().await.unwrap().unwrap().head.target, "/a");
        assert_eq!(reader.next_request().await.unwrap().unwrap().head.target, "/b");
        assert!(reader.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upgrade_requests_leave_handshake_bytes_buffered() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = RequestReader::new(server);

        client
            .write_all(b"GET /ws HTTP/1.1\r\nupgrade: websocket\r\nconnection: Upgrade\r\n\r\n\x81\x05hello")
            .await
            .unwrap();

        let req = reader.next_request().await.unwrap().unwrap();
        assert!(req.head.is_upgrade);
        assert!(req.body.is_empty());
        assert_eq!(&reader.take_buffered()[..], b"\x81\x05hello");
    }

    #[tokio::test]
    async fn response_sized_body() {
        let (mut upstream, ours) = tokio::io::duplex(1024);
        let mut reader = ResponseReader::new(ours);

        upstream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 11\r\n\r\nHello World")
            .await
            .unwrap();

        let head = reader.read_head(false).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");

        let mut body = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"Hello World");
    }

    #[tokio::test]
    async fn response_chunked_body_streams_incrementally() {
        let (mut upstream, ours) = tokio::io::duplex(1024);
        let mut reader = ResponseReader::new(ours);

        upstream
            .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        let head = reader.read_head(false).await.unwrap();
        assert_eq!(head.status, 200);

        // The first chunk must surface before the stream ends.
        upstream.write_all(b"5\r\nfirst\r\n").await.unwrap();
        let chunk = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"first");

        upstream.write_all(b"6\r\nsecond\r\n0\r\n\r\n").await.unwrap();
        let chunk = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"second");
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn response_until_close_body() {
        let (mut upstream, ours) = tokio::io::duplex(1024);
        let mut reader = ResponseReader::new(ours);

        upstream
            .write_all(b"HTTP/1.1 200 OK\r\n\r\nstream until fin")
            .await
            .unwrap();
        drop(upstream);

        let head = reader.read_head(false).await.unwrap();
        assert_eq!(head.status, 200);
        let mut body = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"stream until fin");
    }

    #[tokio::test]
    async fn response_204_has_no_body() {
        let (mut upstream, ours) = tokio::io::duplex(1024);
        let mut reader = ResponseReader::new(ours);

        upstream
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();

        let head = reader.read_head(false).await.unwrap();
        assert_eq!(head.status, 204);
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_request_recomputes_framing() {
        let mut out = Vec::new();
        let mut headers = Headers::new();
        headers.push("host", "example.com");
        headers.push("transfer-encoding", "chunked");

        write_request(&mut out, "POST", "/submit", &headers, b"decoded").await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(!text.contains("transfer-encoding"));
        assert!(text.contains("content-length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\ndecoded"));
    }

    #[tokio::test]
    async fn rewind_replays_prefix_first() {
        let (mut far, near) = tokio::io::duplex(64);
        far.write_all(b" world").await.unwrap();
        drop(far);

        let mut stream = Rewind::new(Bytes::from_static(b"hello"), near);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }
}
