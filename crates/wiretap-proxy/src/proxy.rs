//! HTTP(S) dispatcher: accept loop, plain forward-proxy requests, CONNECT
//! tunnels.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use wiretap_core::error::ProxyError;
use wiretap_core::flow::{Flow, FlowKind, FlowRequest};
use wiretap_core::storage::FlowStore;

use crate::ca::CertificateAuthority;
use crate::egress::{EgressRegistry, Fingerprint};
use crate::http1::{ParsedRequest, RequestReader, ResponseReader, Rewind, write_request};
use crate::pipeline::{ResponseMeta, ResponsePipeline, drive, synthesize_502};
use crate::sink::ClientSink;
use crate::taps::standard_stages;
use crate::tunnel::{self, TunnelCtx, body_text};

pub struct ProxyConfig {
    pub trust_dir: PathBuf,
    pub store_raw_http: bool,
    pub verbose: bool,
    pub fingerprint: Fingerprint,
}

pub struct ProxyServer {
    config: ProxyConfig,
    store: Arc<dyn FlowStore>,
    ca: Arc<CertificateAuthority>,
    egress: Arc<EgressRegistry>,
}

impl ProxyServer {
    /// Bootstraps the CA eagerly; an unavailable trust store is fatal.
    pub fn new(
        config: ProxyConfig,
        store: Arc<dyn FlowStore>,
        egress: Arc<EgressRegistry>,
    ) -> Result<Self, ProxyError> {
        let ca = Arc::new(CertificateAuthority::bootstrap(&config.trust_dir)?);
        Ok(Self {
            config,
            store,
            ca,
            egress,
        })
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub async fn bind(port: u16) -> Result<TcpListener, ProxyError> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves. One task per client.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ProxyError> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("proxy shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            debug!("connection from {peer} ended with error: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), ProxyError> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = RequestReader::new(read_half);

        loop {
            let Some(request) = reader.next_request().await? else {
                return Ok(());
            };

            if request.head.method.eq_ignore_ascii_case("CONNECT") {
                return self
                    .handle_connect(reader, write_half, request, peer)
                    .await;
            }

            let closed = self.handle_plain(&mut write_half, request, peer).await?;
            if closed {
                return Ok(());
            }
        }
    }

    /// CONNECT: answer 200, impersonate the origin, and hand both sides of
    /// the tunnel to the in-tunnel parser.
    async fn handle_connect(
        &self,
        reader: RequestReader<tokio::io::ReadHalf<TcpStream>>,
        mut write_half: WriteHalf<TcpStream>,
        request: ParsedRequest,
        peer: SocketAddr,
    ) -> Result<(), ProxyError> {
        let (host, port) = split_host_port(&request.head.target, 443);
        debug!("CONNECT {host}:{port} from {peer}");

        write_half
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        write_half.flush().await?;

        let credential = self.ca.credential_for(&host).await?;

        // Rejoin the socket, replaying anything the client pipelined behind
        // the CONNECT head, and finish the TLS handshake as the origin.
        let (read_half, leftover) = reader.into_parts();
        let rejoined = Rewind::new(leftover.freeze(), read_half.unsplit(write_half));
        let acceptor = tokio_rustls::TlsAcceptor::from(credential);
        let client_tls = acceptor
            .accept(rejoined)
            .await
            .map_err(|e| ProxyError::Tls(format!("client handshake for {host}: {e}")))?;

        // The egress dial negotiates HTTP/1.1 only; a failed dial still
        // enters the tunnel so requests get proper 502s.
        let upstream = match self
            .egress
            .connect(&host, port, self.config.fingerprint)
            .await
        {
            Ok(upstream) => Some(upstream),
            Err(e) => {
                warn!("upstream dial {host}:{port} failed: {e}");
                None
            }
        };

        let ctx = TunnelCtx {
            store: self.store.clone(),
            host,
            port,
            client_addr: peer.to_string(),
            store_raw_http: self.config.store_raw_http,
            verbose: self.config.verbose,
        };
        tunnel::serve(ctx, client_tls, upstream).await
    }

    /// Plain forward-proxy request with an absolute-form target.
    async fn handle_plain(
        &self,
        write_half: &mut WriteHalf<TcpStream>,
        request: ParsedRequest,
        peer: SocketAddr,
    ) -> Result<bool, ProxyError> {
        let started = Instant::now();
        let head_request = request.head.method.eq_ignore_ascii_case("HEAD");

        let uri: http::Uri = request
            .head
            .target
            .parse()
            .map_err(|e| ProxyError::Http(format!("invalid request target: {e}")))?;
        let Some(host) = uri.host().map(str::to_owned) else {
            return Err(ProxyError::Http(
                "proxy requests must use absolute-form targets".into(),
            ));
        };
        let port = uri.port_u16().unwrap_or(80);
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".into());

        let mut flow = Flow::new(
            FlowKind::PlainHttp,
            &host,
            FlowRequest {
                method: request.head.method.clone(),
                url: request.head.target.clone(),
                path: path.clone(),
                headers: request.head.headers.clone(),
                body: body_text(&request.body),
            },
        );
        flow.client_addr = Some(peer.to_string());
        self.store.save_flow(&flow)?;

        let mut sink = ClientSink::new(&mut *write_half);

        let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(upstream) => upstream,
            Err(e) => {
                synthesize_502(
                    &mut sink,
                    &mut flow,
                    &self.store,
                    &format!("upstream connect failed: {e}"),
                )
                .await;
                return Ok(true);
            }
        };
        let (upstream_read, mut upstream_write) = upstream.split();

        if let Err(e) = write_request(
            &mut upstream_write,
            &request.head.method,
            &path,
            &request.head.headers,
            &request.body,
        )
        .await
        {
            synthesize_502(
                &mut sink,
                &mut flow,
                &self.store,
                &format!("upstream write failed: {e}"),
            )
            .await;
            return Ok(true);
        }

        let mut response_reader = ResponseReader::new(upstream_read);
        let head = match response_reader.read_head(head_request).await {
            Ok(head) => head,
            Err(e) => {
                synthesize_502(
                    &mut sink,
                    &mut flow,
                    &self.store,
                    &format!("upstream read failed: {e}"),
                )
                .await;
                return Ok(true);
            }
        };

        // Raw HTTP capture is a tunnel concern; plain flows skip it.
        let meta = ResponseMeta::from_head(flow.id.clone(), &head, false, self.config.verbose);
        let (transforms, taps) = standard_stages(&self.store, &flow.id);
        let mut pipeline = ResponsePipeline::start(
            flow,
            meta,
            self.store.clone(),
            transforms,
            taps,
            sink,
            started,
        )
        .await?;
        drive(&mut response_reader, &mut pipeline).await?;
        Ok(pipeline.sink_closed())
    }
}

/// Split `host:port`, defaulting the port. Handles bracketed IPv6 literals.
fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once(']') {
            let port = port
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (target.to_string(), default_port),
        },
        _ => (target.to_string(), default_port),
    }
}
