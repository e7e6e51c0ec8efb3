//! In-tunnel HTTP parsing and dispatch.
//!
//! After a CONNECT the proxy terminates TLS as the origin and feeds the
//! decrypted client stream through the request parser, piping each response
//! back through the pipeline. WebSocket upgrades bypass the pipeline and
//! become an opaque bidirectional byte pipe after a 101 handshake.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};
use wiretap_core::error::ProxyError;
use wiretap_core::flow::{Flow, FlowKind, FlowRequest, FlowResponse, Headers};
use wiretap_core::storage::FlowStore;

use crate::http1::{
    ParsedRequest, RequestReader, ResponseReader, canonical_request, parse_response_head,
    read_head_raw, write_request,
};
use crate::pipeline::{ResponseMeta, ResponsePipeline, drive, synthesize_502};
use crate::sink::ClientSink;
use crate::taps::standard_stages;

/// Per-tunnel context shared by every request on the connection.
pub struct TunnelCtx {
    pub store: Arc<dyn FlowStore>,
    pub host: String,
    pub port: u16,
    pub client_addr: String,
    pub store_raw_http: bool,
    pub verbose: bool,
}

impl TunnelCtx {
    fn authority(&self) -> String {
        if self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn url_for(&self, target: &str) -> String {
        format!("https://{}{}", self.authority(), target)
    }
}

type UpstreamPair<U> = (ResponseReader<ReadHalf<U>>, WriteHalf<U>);

/// Serve parsed requests from a decrypted tunnel until the client goes away.
///
/// `upstream` is `None` when the origin dial failed; requests are then
/// answered with synthetic 502s.
pub async fn serve<C, U>(ctx: TunnelCtx, client: C, upstream: Option<U>) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (client_read, mut client_write) = tokio::io::split(client);
    let mut reader = RequestReader::new(client_read);
    let mut upstream: Option<UpstreamPair<U>> = upstream.map(|u| {
        let (up_read, up_write) = tokio::io::split(u);
        (ResponseReader::new(up_read), up_write)
    });

    loop {
        let request = match reader.next_request().await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!("tunnel request parse failed: {e}");
                return Err(e);
            }
        };

        if request.head.is_upgrade {
            return handle_upgrade(&ctx, reader, client_write, upstream, request).await;
        }

        let closed = handle_request(&ctx, &mut client_write, upstream.as_mut(), request).await?;
        if closed {
            return Ok(());
        }
    }
}

async fn handle_request<C, U>(
    ctx: &TunnelCtx,
    client_write: &mut WriteHalf<C>,
    upstream: Option<&mut UpstreamPair<U>>,
    request: ParsedRequest,
) -> Result<bool, ProxyError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let started = Instant::now();
    let head_request = request.head.method.eq_ignore_ascii_case("HEAD");

    let mut flow = Flow::new(
        FlowKind::TlsHttp,
        &ctx.host,
        FlowRequest {
            method: request.head.method.clone(),
            url: ctx.url_for(&request.head.target),
            path: request.head.target.clone(),
            headers: request.head.headers.clone(),
            body: body_text(&request.body),
        },
    );
    flow.client_addr = Some(ctx.client_addr.clone());

    if ctx.store_raw_http {
        ctx.store.init_raw_http(
            &flow.id,
            &canonical_request(
                &request.head.method,
                &request.head.target,
                &request.head.headers,
                &request.body,
            ),
        )?;
    }
    ctx.store.save_flow(&flow)?;

    let mut sink = ClientSink::new(&mut *client_write);

    let Some((response_reader, upstream_write)) = upstream.map(|pair| (&mut pair.0, &mut pair.1))
    else {
        synthesize_502(
            &mut sink,
            &mut flow,
            &ctx.store,
            "no upstream connection available",
        )
        .await;
        return Ok(true);
    };

    if let Err(e) = write_request(
        upstream_write,
        &request.head.method,
        &request.head.target,
        &request.head.headers,
        &request.body,
    )
    .await
    {
        synthesize_502(
            &mut sink,
            &mut flow,
            &ctx.store,
            &format!("upstream write failed: {e}"),
        )
        .await;
        return Ok(true);
    }

    let head = match response_reader.read_head(head_request).await {
        Ok(head) => head,
        Err(e) => {
            synthesize_502(
                &mut sink,
                &mut flow,
                &ctx.store,
                &format!("upstream read failed: {e}"),
            )
            .await;
            return Ok(true);
        }
    };

    let meta = ResponseMeta::from_head(flow.id.clone(), &head, ctx.store_raw_http, ctx.verbose);
    if meta.verbose {
        debug!(
            "{} {} -> {} ({})",
            flow.request.method,
            flow.request.url,
            meta.status,
            meta.content_type.as_deref().unwrap_or("-")
        );
    }
    let (transforms, taps) = standard_stages(&ctx.store, &flow.id);
    let mut pipeline = ResponsePipeline::start(
        flow,
        meta,
        ctx.store.clone(),
        transforms,
        taps,
        sink,
        started,
    )
    .await?;
    drive(response_reader, &mut pipeline).await?;
    Ok(pipeline.sink_closed())
}

async fn handle_upgrade<C, U>(
    ctx: &TunnelCtx,
    mut reader: RequestReader<ReadHalf<C>>,
    mut client_write: WriteHalf<C>,
    upstream: Option<UpstreamPair<U>>,
    request: ParsedRequest,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let started = Instant::now();
    let mut flow = Flow::new(
        FlowKind::Websocket,
        &ctx.host,
        FlowRequest {
            method: request.head.method.clone(),
            url: ctx.url_for(&request.head.target),
            path: request.head.target.clone(),
            headers: request.head.headers.clone(),
            body: None,
        },
    );
    flow.client_addr = Some(ctx.client_addr.clone());
    ctx.store.save_flow(&flow)?;

    let Some((upstream_reader, upstream_write)) = upstream else {
        client_write
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
            .await?;
        record_upgrade_response(ctx, &mut flow, 502, "Bad Gateway", Headers::new(), started);
        return Ok(());
    };
    let (mut upstream_read, mut upstream_buf) = upstream_reader.into_parts();
    let mut upstream_write = upstream_write;

    // Forward the upgrade verbatim: rebuilt request line, the original Host
    // first, every other header as parsed, then any handshake bytes the
    // client already sent past the head.
    let head_bytes = reader.take_buffered();
    let mut handshake = format!("{} {} HTTP/1.1\r\n", request.head.method, request.head.target);
    let host_value = request
        .head
        .headers
        .get("host")
        .map(str::to_owned)
        .unwrap_or_else(|| ctx.authority());
    handshake.push_str(&format!("host: {host_value}\r\n"));
    for (name, value) in request.head.headers.iter() {
        if name == "host" {
            continue;
        }
        handshake.push_str(name);
        handshake.push_str(": ");
        handshake.push_str(value);
        handshake.push_str("\r\n");
    }
    handshake.push_str("\r\n");

    let upstream_result = async {
        upstream_write.write_all(handshake.as_bytes()).await?;
        if !head_bytes.is_empty() {
            upstream_write.write_all(&head_bytes).await?;
        }
        upstream_write.flush().await?;
        Ok::<(), std::io::Error>(())
    }
    .await;
    if let Err(e) = upstream_result {
        warn!("websocket upgrade write to {} failed: {e}", ctx.host);
        client_write
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
            .await?;
        record_upgrade_response(ctx, &mut flow, 502, "Bad Gateway", Headers::new(), started);
        return Ok(());
    }

    // Read the upstream answer up to the end-of-headers marker; any bytes
    // past it are early frames and belong to the client.
    if let Err(e) = read_head_raw(&mut upstream_read, &mut upstream_buf).await {
        warn!("websocket upgrade read from {} failed: {e}", ctx.host);
        client_write
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
            .await?;
        record_upgrade_response(ctx, &mut flow, 502, "Bad Gateway", Headers::new(), started);
        return Ok(());
    }

    let (head, _) = parse_response_head(&upstream_buf)?
        .ok_or_else(|| ProxyError::Http("incomplete upgrade response head".into()))?;

    record_upgrade_response(
        ctx,
        &mut flow,
        head.status,
        &head.reason,
        head.headers.clone(),
        started,
    );
    client_write.write_all(&upstream_buf).await?;
    client_write.flush().await?;

    if head.status != 101 {
        info!(
            "websocket upgrade to {} denied with {}",
            ctx.host, head.status
        );
        return Ok(());
    }

    // 101: join both sockets into an opaque pipe for the rest of the
    // connection.
    let (client_read, client_buf) = reader.into_parts();
    let mut client = client_read.unsplit(client_write);
    let mut upstream = upstream_read.unsplit(upstream_write);
    debug_assert!(client_buf.is_empty());

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(
                "websocket tunnel to {} closed ({to_upstream}B up, {to_client}B down)",
                ctx.host
            );
        }
        Err(e) => debug!("websocket tunnel to {} errored: {e}", ctx.host),
    }
    Ok(())
}

fn record_upgrade_response(
    ctx: &TunnelCtx,
    flow: &mut Flow,
    status: u16,
    reason: &str,
    headers: Headers,
    started: Instant,
) {
    flow.response = Some(FlowResponse {
        status,
        status_text: reason.to_string(),
        headers,
        body: None,
        duration_ms: started.elapsed().as_millis() as u64,
    });
    if let Err(e) = ctx.store.save_flow(flow) {
        warn!("failed to save websocket flow: {e}");
    }
}

pub(crate) fn body_text(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(body).into_owned())
    }
}
