//! Upstream TLS egress providers.
//!
//! The dispatcher dials origins through a [`TlsEgress`] capability: either
//! the native rustls stack, or an out-of-process helper that impersonates
//! real browser ClientHellos. Both pin ALPN to `http/1.1` so everything
//! downstream stays HTTP/1. Interception requires trusting the real world,
//! so upstream certificates are never validated.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rustls::ClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use wiretap_core::error::ProxyError;

/// Client profiles a fingerprinted dialer can impersonate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fingerprint {
    Chrome120,
    Firefox120,
    Safari16,
    Ios14,
    Android11,
    Electron,
    Randomized,
}

impl Fingerprint {
    pub const DEFAULT: Fingerprint = Fingerprint::Chrome120;

    /// Parse a tag; unknown tags fall back to the default profile.
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "chrome120" => Fingerprint::Chrome120,
            "firefox120" => Fingerprint::Firefox120,
            "safari16" => Fingerprint::Safari16,
            "ios14" => Fingerprint::Ios14,
            "android11" => Fingerprint::Android11,
            "electron" => Fingerprint::Electron,
            "randomized" => Fingerprint::Randomized,
            other => {
                debug!("unknown fingerprint tag {other:?}, using default");
                Fingerprint::DEFAULT
            }
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Fingerprint::Chrome120 => "chrome120",
            Fingerprint::Firefox120 => "firefox120",
            Fingerprint::Safari16 => "safari16",
            Fingerprint::Ios14 => "ios14",
            Fingerprint::Android11 => "android11",
            Fingerprint::Electron => "electron",
            Fingerprint::Randomized => "randomized",
        }
    }
}

/// A connected upstream byte stream.
pub trait EgressStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> EgressStream for T {}

impl std::fmt::Debug for dyn EgressStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<egress stream>")
    }
}

/// Capability set for dialing TLS origins.
#[async_trait]
pub trait TlsEgress: Send + Sync {
    async fn initialize(&self) -> Result<(), ProxyError>;

    async fn connect(
        &self,
        host: &str,
        port: u16,
        fingerprint: Fingerprint,
    ) -> Result<Box<dyn EgressStream>, ProxyError>;

    async fn shutdown(&self) -> Result<(), ProxyError>;

    fn is_ready(&self) -> bool;

    /// Human-readable name of this provider (e.g. "native", "helper").
    fn name(&self) -> &str;
}

/// Accepts every upstream certificate; interception is the point.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// The in-process rustls dialer. Ignores the requested fingerprint; the
/// native stack has exactly one ClientHello shape.
pub struct NativeEgress {
    connector: TlsConnector,
    ready: AtomicBool,
}

impl NativeEgress {
    pub fn new() -> Self {
        let mut config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Self {
            connector: TlsConnector::from(Arc::new(config)),
            ready: AtomicBool::new(false),
        }
    }
}

impl Default for NativeEgress {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TlsEgress for NativeEgress {
    async fn initialize(&self) -> Result<(), ProxyError> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
        fingerprint: Fingerprint,
    ) -> Result<Box<dyn EgressStream>, ProxyError> {
        if fingerprint != Fingerprint::DEFAULT {
            debug!(
                "native egress cannot impersonate {}, using its own hello",
                fingerprint.as_tag()
            );
        }
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| ProxyError::UpstreamConnect(format!("{host}:{port}: {e}")))?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::UpstreamConnect(format!("invalid SNI {host}: {e}")))?;
        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Tls(format!("{host}:{port} handshake: {e}")))?;
        Ok(Box::new(tls))
    }

    async fn shutdown(&self) -> Result<(), ProxyError> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "native"
    }
}

/// Where the out-of-process helper listens.
#[derive(Debug, Clone)]
pub enum HelperAddr {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(std::net::SocketAddr),
}

/// Handshake line sent to the helper.
#[derive(Serialize)]
struct ConnectRequest<'a> {
    host: &'a str,
    port: u16,
    fingerprint: &'a str,
}

#[derive(Deserialize)]
struct ConnectReply {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Dialer backed by a fingerprinting helper process.
///
/// Protocol: one line-delimited JSON request, one line-delimited JSON reply,
/// then the socket becomes an opaque byte pipe for the TLS connection.
pub struct HelperEgress {
    addr: HelperAddr,
    ready: AtomicBool,
}

impl HelperEgress {
    pub fn new(addr: HelperAddr) -> Self {
        Self {
            addr,
            ready: AtomicBool::new(false),
        }
    }

    async fn dial(&self) -> Result<Box<dyn EgressStream>, ProxyError> {
        match &self.addr {
            #[cfg(unix)]
            HelperAddr::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| ProxyError::Egress(format!("{}: {e}", path.display())))?;
                Ok(Box::new(stream))
            }
            HelperAddr::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| ProxyError::Egress(format!("{addr}: {e}")))?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[async_trait]
impl TlsEgress for HelperEgress {
    async fn initialize(&self) -> Result<(), ProxyError> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
        fingerprint: Fingerprint,
    ) -> Result<Box<dyn EgressStream>, ProxyError> {
        let mut stream = self.dial().await?;

        let request = ConnectRequest {
            host,
            port,
            fingerprint: fingerprint.as_tag(),
        };
        let mut line = serde_json::to_vec(&request)
            .map_err(|e| ProxyError::Egress(format!("encode handshake: {e}")))?;
        line.push(b'\n');
        stream.write_all(&line).await.map_err(ProxyError::Io)?;

        // Read exactly one reply line; anything after it belongs to the pipe.
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await.map_err(ProxyError::Io)?;
            if n == 0 {
                return Err(ProxyError::Egress("helper closed during handshake".into()));
            }
            if byte[0] == b'\n' {
                break;
            }
            reply.push(byte[0]);
            if reply.len() > 16 * 1024 {
                return Err(ProxyError::Egress("oversized helper reply".into()));
            }
        }
        let reply: ConnectReply = serde_json::from_slice(&reply)
            .map_err(|e| ProxyError::Egress(format!("invalid helper reply: {e}")))?;
        if !reply.success {
            return Err(ProxyError::Egress(
                reply.error.unwrap_or_else(|| "unknown helper error".into()),
            ));
        }
        Ok(stream)
    }

    async fn shutdown(&self) -> Result<(), ProxyError> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "helper"
    }
}

/// Selects the active egress provider.
///
/// Switching providers shuts the previous one down before initialising the
/// next; connects only take the lock long enough to clone the handle.
pub struct EgressRegistry {
    active: Mutex<Option<Arc<dyn TlsEgress>>>,
}

impl EgressRegistry {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
        }
    }

    pub async fn install(&self, provider: Arc<dyn TlsEgress>) -> Result<(), ProxyError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!("shutting down {} egress provider", previous.name());
            previous.shutdown().await?;
        }
        provider.initialize().await?;
        info!("egress provider: {}", provider.name());
        *active = Some(provider);
        Ok(())
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        fingerprint: Fingerprint,
    ) -> Result<Box<dyn EgressStream>, ProxyError> {
        let provider = self
            .active
            .lock()
            .await
            .clone()
            .ok_or_else(|| ProxyError::Egress("no egress provider installed".into()))?;
        provider.connect(host, port, fingerprint).await
    }
}

impl Default for EgressRegistry {
    fn default() -> Self {
        Self::new()
    }
}
