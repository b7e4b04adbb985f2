//! Server Identity - TLS for the transport
//!
//! The channel only provides confidentiality. Peers are authenticated by
//! the shared secret, so the identity is either the configured certificate
//! or a self-signed one generated at startup, and clients do not check it.

use anyhow::{anyhow, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{
    CertificateDer, InvalidDnsNameError, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Name presented by clients during the handshake
pub const SERVER_NAME: &str = "localhost";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Where the identity came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    Certificate(PathBuf),
    Ephemeral,
}

/// Certificate chain and key the listener presents
pub struct ServerIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    source: IdentitySource,
}

impl ServerIdentity {
    /// Configured certificate if given, otherwise a fresh self-signed one
    pub fn from_config(certificate: Option<&Path>) -> Result<Self> {
        match certificate {
            Some(path) => Self::load_pem(path),
            None => Self::ephemeral(),
        }
    }

    /// PEM file holding the certificate chain and its private key
    pub fn load_pem(path: &Path) -> Result<Self> {
        let open = || -> Result<BufReader<File>> {
            let file = File::open(path).with_context(|| format!("opening certificate {}", path.display()))?;
            Ok(BufReader::new(file))
        };

        let certs = rustls_pemfile::certs(&mut open()?)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("parsing certificates in {}", path.display()))?;
        if certs.is_empty() {
            return Err(anyhow!("no certificate found in {}", path.display()));
        }

        let key = rustls_pemfile::private_key(&mut open()?)
            .with_context(|| format!("parsing private key in {}", path.display()))?
            .ok_or_else(|| anyhow!("no private key found in {}", path.display()))?;

        Ok(Self {
            certs,
            key,
            source: IdentitySource::Certificate(path.to_path_buf()),
        })
    }

    pub fn ephemeral() -> Result<Self> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
                .context("generating ephemeral certificate")?;

        Ok(Self {
            certs: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
            source: IdentitySource::Ephemeral,
        })
    }

    pub fn source(&self) -> &IdentitySource {
        &self.source
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .context("building TLS server config")?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Client-side TLS that accepts whatever certificate the server presents
pub fn connector() -> Result<TlsConnector, rustls::Error> {
    let provider = provider();
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name() -> Result<ServerName<'static>, InvalidDnsNameError> {
    ServerName::try_from(SERVER_NAME)
}

/// Skips chain validation but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_ephemeral_identity() {
        let identity = ServerIdentity::from_config(None).unwrap();
        assert_eq!(identity.source(), &IdentitySource::Ephemeral);
        assert!(identity.acceptor().is_ok());
    }

    #[test]
    fn test_pem_identity_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["dev.local".to_string()]).unwrap();
        let pem = format!("{}{}", cert.pem(), key_pair.serialize_pem());
        let path = dir.path().join("server.pem");
        std::fs::write(&path, pem).unwrap();

        let identity = ServerIdentity::from_config(Some(&path)).unwrap();
        assert_eq!(identity.source(), &IdentitySource::Certificate(path));
        assert!(identity.acceptor().is_ok());
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rcgen::CertifiedKey { cert, .. } =
            rcgen::generate_simple_self_signed(vec!["dev.local".to_string()]).unwrap();
        let path = dir.path().join("cert-only.pem");
        std::fs::write(&path, cert.pem()).unwrap();

        assert!(ServerIdentity::load_pem(&path).is_err());
        assert!(ServerIdentity::load_pem(&dir.path().join("absent.pem")).is_err());
    }

    #[tokio::test]
    async fn test_handshake_without_trust() {
        let acceptor = ServerIdentity::ephemeral().unwrap().acceptor().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            buf
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut tls = connector().unwrap().connect(server_name().unwrap(), tcp).await.unwrap();
        tls.write_all(b"ping").await.unwrap();
        tls.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }
}
