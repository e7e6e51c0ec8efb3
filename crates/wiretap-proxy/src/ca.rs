//! Root CA and per-host certificate minter.
//!
//! The root lives in the trust directory as `ca.crt`/`ca.key` (PEM) and is
//! generated on first start. Leaf credentials are minted lazily per SNI host
//! and cached for the process lifetime; concurrent mints for the same host
//! deduplicate behind a single lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::Mutex;
use tracing::{debug, info};
use wiretap_core::error::ProxyError;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_COMMON_NAME: &str = "Proxy CA";
const RSA_BITS: usize = 2048;
const CA_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;

struct CaInner {
    cert: rcgen::Certificate,
    key: KeyPair,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
}

pub struct CertificateAuthority {
    inner: Arc<CaInner>,
    cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the root from the trust directory, or generate and persist one.
    ///
    /// An unreadable trust directory is fatal at process start.
    pub fn bootstrap(trust_dir: &Path) -> Result<Self, ProxyError> {
        std::fs::create_dir_all(trust_dir).map_err(|e| {
            ProxyError::TrustStoreUnavailable(format!("{}: {e}", trust_dir.display()))
        })?;
        std::fs::read_dir(trust_dir).map_err(|e| {
            ProxyError::TrustStoreUnavailable(format!("{}: {e}", trust_dir.display()))
        })?;

        let cert_path = trust_dir.join(CA_CERT_FILE);
        let key_path = trust_dir.join(CA_KEY_FILE);

        let (cert, key, cert_pem) = if cert_path.exists() || key_path.exists() {
            if !(cert_path.exists() && key_path.exists()) {
                return Err(ProxyError::TrustStoreUnavailable(format!(
                    "{} and {} must both exist",
                    cert_path.display(),
                    key_path.display()
                )));
            }
            let cert_pem = std::fs::read_to_string(&cert_path).map_err(|e| {
                ProxyError::TrustStoreUnavailable(format!("{}: {e}", cert_path.display()))
            })?;
            let key_pem = std::fs::read_to_string(&key_path).map_err(|e| {
                ProxyError::TrustStoreUnavailable(format!("{}: {e}", key_path.display()))
            })?;
            let key = KeyPair::from_pem(&key_pem)
                .map_err(|e| ProxyError::Certificate(format!("invalid CA key: {e}")))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .map_err(|e| ProxyError::Certificate(format!("invalid CA cert: {e}")))?;
            // Re-signing with the persisted key reproduces an issuer whose
            // name and key match the trusted ca.crt; children chain to it.
            let cert = params
                .self_signed(&key)
                .map_err(|e| ProxyError::Certificate(format!("failed to rebuild CA: {e}")))?;
            debug!("loaded proxy root CA from {}", trust_dir.display());
            (cert, key, cert_pem)
        } else {
            let (cert, key) = generate_root()?;
            let cert_pem = cert.pem();
            std::fs::write(&cert_path, &cert_pem).map_err(|e| {
                ProxyError::TrustStoreUnavailable(format!("{}: {e}", cert_path.display()))
            })?;
            std::fs::write(&key_path, key.serialize_pem()).map_err(|e| {
                ProxyError::TrustStoreUnavailable(format!("{}: {e}", key_path.display()))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600));
            }
            info!("generated proxy root CA in {}", trust_dir.display());
            (cert, key, cert_pem)
        };

        let cert_der = cert.der().clone();
        Ok(Self {
            inner: Arc::new(CaInner {
                cert,
                key,
                cert_der,
                cert_pem,
            }),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The root certificate in PEM, for installing into client trust stores.
    pub fn ca_cert_pem(&self) -> &str {
        &self.inner.cert_pem
    }

    /// The root certificate in DER, for programmatic trust roots.
    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.inner.cert_der.clone()
    }

    /// Server credential for `host`: cached, or minted and inserted.
    ///
    /// The cache lock is held across generation, so concurrent callers for
    /// the same host all observe the one credential.
    pub async fn credential_for(&self, host: &str) -> Result<Arc<ServerConfig>, ProxyError> {
        let mut cache = self.cache.lock().await;
        if let Some(config) = cache.get(host) {
            return Ok(config.clone());
        }

        let inner = self.inner.clone();
        let host_owned = host.to_string();
        let config = tokio::task::spawn_blocking(move || mint(&inner, &host_owned))
            .await
            .map_err(|e| ProxyError::Certificate(format!("mint task failed: {e}")))??;

        let config = Arc::new(config);
        cache.insert(host.to_string(), config.clone());
        debug!("minted certificate for {host}");
        Ok(config)
    }
}

fn mint(ca: &CaInner, host: &str) -> Result<ServerConfig, ProxyError> {
    let key = generate_rsa_key_pair()?;

    // `CertificateParams::new` turns the name into a DNS SAN, or an IP SAN
    // for address literals.
    let mut params = CertificateParams::new(vec![host.to_string()])
        .map_err(|e| ProxyError::Certificate(format!("invalid host name {host}: {e}")))?;
    params.distinguished_name.push(DnType::CommonName, host);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

    let cert = params
        .signed_by(&key, &ca.cert, &ca.key)
        .map_err(|e| ProxyError::Certificate(format!("failed to sign leaf for {host}: {e}")))?;

    let chain = vec![cert.der().clone(), ca.cert_der.clone()];
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key_der)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    // HTTP/1.1 only; the tunnel parser never speaks h2.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn generate_root() -> Result<(rcgen::Certificate, KeyPair), ProxyError> {
    let key = generate_rsa_key_pair()?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key)
        .map_err(|e| ProxyError::Certificate(format!("failed to self-sign root: {e}")))?;
    Ok((cert, key))
}

/// 2048-bit RSA key in rcgen form (SHA-256 signatures).
fn generate_rsa_key_pair() -> Result<KeyPair, ProxyError> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, RSA_BITS)
        .map_err(|e| ProxyError::Certificate(format!("rsa keygen failed: {e}")))?;
    let der = key
        .to_pkcs8_der()
        .map_err(|e| ProxyError::Certificate(format!("rsa key encoding failed: {e}")))?;
    KeyPair::try_from(der.as_bytes())
        .map_err(|e| ProxyError::Certificate(format!("rsa key import failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_generates_and_reloads_the_root() {
        let dir = tempfile::tempdir().unwrap();

        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();
        assert!(dir.path().join("ca.crt").exists());
        assert!(dir.path().join("ca.key").exists());
        let pem = ca.ca_cert_pem().to_string();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        // A second bootstrap loads the persisted root instead of re-generating.
        let reloaded = CertificateAuthority::bootstrap(dir.path()).unwrap();
        assert_eq!(reloaded.ca_cert_pem(), pem);
    }

    #[test]
    fn bootstrap_rejects_half_a_trust_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.crt"), "not a cert").unwrap();

        let err = CertificateAuthority::bootstrap(dir.path()).unwrap_err();
        assert!(matches!(err, ProxyError::TrustStoreUnavailable(_)));
    }

    #[tokio::test]
    async fn concurrent_mints_share_one_credential() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::bootstrap(dir.path()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ca = ca.clone();
            handles.push(tokio::spawn(
                async move { ca.credential_for("example.com").await },
            ));
        }
        let mut configs = Vec::new();
        for handle in handles {
            configs.push(handle.await.unwrap().unwrap());
        }
        for config in &configs[1..] {
            assert!(Arc::ptr_eq(&configs[0], config));
        }

        // Cache hit afterwards.
        let again = ca.credential_for("example.com").await.unwrap();
        assert!(Arc::ptr_eq(&configs[0], &again));
    }
}
