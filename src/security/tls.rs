//! Mutually authenticated TLS for replication sessions
//!
//! ```text
//! pems/
//!   cert.pem   own certificate chain (leaf first)
//!   key.pem    private key for the leaf
//!   ca.pem     trust anchors that peer certificates must chain to
//! ```
//!
//! Each server builds its own rustls configuration from its bundle with
//! the ring provider passed explicitly; nothing is installed process-wide.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::config::IdentifyFn;
use crate::error::{ReplicationError, ReplicationResult};
use crate::security::AuthError;
use crate::types::PeerIdentity;

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";
pub const CA_FILE: &str = "ca.pem";

/// How long an accepted connection may take to finish the TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(context: &str, err: impl std::fmt::Display) -> ReplicationError {
    ReplicationError::Tls(format!("{}: {}", context, err))
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Certificate chain, key and trust anchors loaded from a `pems` directory
pub struct CredentialBundle {
    dir: PathBuf,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: Arc<RootCertStore>,
}

impl CredentialBundle {
    pub fn load<P: AsRef<Path>>(dir: P) -> ReplicationResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(ReplicationError::Config(format!(
                "credential bundle is not a directory: {}",
                dir.display()
            )));
        }

        let certs = read_certs(&dir.join(CERT_FILE))?;
        if certs.is_empty() {
            return Err(ReplicationError::Config(format!(
                "no certificate in {}",
                dir.join(CERT_FILE).display()
            )));
        }

        let key_path = dir.join(KEY_FILE);
        let key = rustls_pemfile::private_key(&mut open_pem(&key_path)?)?.ok_or_else(|| {
            ReplicationError::Config(format!("no private key in {}", key_path.display()))
        })?;

        let mut roots = RootCertStore::empty();
        for ca in read_certs(&dir.join(CA_FILE))? {
            roots.add(ca).map_err(|e| tls_error("invalid trust anchor", e))?;
        }
        if roots.is_empty() {
            return Err(ReplicationError::Config(format!(
                "no trust anchors in {}",
                dir.join(CA_FILE).display()
            )));
        }

        tracing::debug!(
            dir = %dir.display(),
            chain = certs.len(),
            anchors = roots.len(),
            "loaded credential bundle"
        );

        Ok(Self {
            dir,
            certs,
            key,
            roots: Arc::new(roots),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fingerprint of this side's leaf certificate
    pub fn own_fingerprint(&self) -> Option<String> {
        self.certs.first().map(fingerprint)
    }

    /// Server side: client certificates are required
    pub fn server_config(&self) -> ReplicationResult<ServerConfig> {
        let provider = provider();
        let verifier = WebPkiClientVerifier::builder_with_provider(self.roots.clone(), provider.clone())
            .build()
            .map_err(|e| tls_error("client verifier", e))?;

        ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error("protocol versions", e))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| tls_error("server certificate", e))
    }

    /// Client side: presents this bundle's certificate
    pub fn client_config(&self) -> ReplicationResult<ClientConfig> {
        ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error("protocol versions", e))?
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| tls_error("client certificate", e))
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("dir", &self.dir)
            .field("chain", &self.certs.len())
            .finish()
    }
}

fn open_pem(path: &Path) -> ReplicationResult<BufReader<File>> {
    let file = File::open(path).map_err(|e| {
        ReplicationError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(BufReader::new(file))
}

fn read_certs(path: &Path) -> ReplicationResult<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// Inbound side of secure mode
///
/// Wraps each raw connection in TLS, derives the peer identity from its
/// verified certificate and asks `identify` whether to serve it.
pub struct SecureChannelGate {
    acceptor: TlsAcceptor,
    identify: IdentifyFn,
    handshake_timeout: Duration,
}

impl SecureChannelGate {
    pub fn new(bundle: &CredentialBundle, identify: IdentifyFn) -> ReplicationResult<Self> {
        let config = bundle.server_config()?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            identify,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Handshake, then identify
    ///
    /// `accepted -> authenticating -> identified | rejected`. On any error,
    /// including a handshake that outlives the timeout, the stream is
    /// dropped, which closes the connection.
    pub async fn accept<S>(&self, stream: S) -> ReplicationResult<(server::TlsStream<S>, PeerIdentity)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let tls = tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream))
            .await
            .map_err(|_| {
                ReplicationError::Tls(format!(
                    "handshake timed out after {:?}",
                    self.handshake_timeout
                ))
            })?
            .map_err(|e| tls_error("handshake failed", e))?;

        let peer = {
            let (_, connection) = tls.get_ref();
            let leaf = connection
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or_else(|| ReplicationError::Tls("peer sent no certificate".to_string()))?;
            PeerIdentity::from_certificate(fingerprint(leaf))
        };

        if !(self.identify)(&peer) {
            return Err(ReplicationError::Unauthenticated(AuthError::Rejected(format!(
                "identify refused {}",
                peer.subject
            ))));
        }

        Ok((tls, peer))
    }
}

impl std::fmt::Debug for SecureChannelGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecureChannelGate")
    }
}

/// Outbound side of secure mode, used by the RPC client
#[derive(Clone)]
pub struct SecureConnector {
    connector: TlsConnector,
}

impl SecureConnector {
    pub fn new(bundle: &CredentialBundle) -> ReplicationResult<Self> {
        let config = bundle.client_config()?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// `host` is checked against the server certificate (DNS name or IP)
    pub async fn connect<S>(&self, host: &str, stream: S) -> ReplicationResult<client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(host.to_owned())
            .map_err(|e| tls_error("invalid server name", e))?;
        self.connector
            .connect(name, stream)
            .await
            .map_err(|e| tls_error("handshake failed", e))
    }
}

impl std::fmt::Debug for SecureConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecureConnector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_directory_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = CredentialBundle::load(temp_dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
    }

    #[test]
    fn test_missing_files_are_config_errors() {
        let temp_dir = TempDir::new().unwrap();
        let err = CredentialBundle::load(temp_dir.path()).unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let fp = fingerprint(&cert);
        assert_eq!(fp.len(), 64);
        assert_eq!(
            fp,
            "039058c6f2c0cb492c533b0a4d14ef77cc0f78abccced5287d84a1a2011cfb81"
        );
    }
}
