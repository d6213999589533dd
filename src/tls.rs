//! TLS transport setup.
//!
//! The protocol pins TLS 1.2 on both ends. Servers present a certificate
//! chain loaded from PEM files (or generated on the fly for tests) and may
//! require client certificates; clients verify the server against the
//! webpki root set plus any extra roots from configuration.

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// A certificate chain and its private key.
pub struct TlsIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsIdentity {
    /// Load a chain and key from PEM files.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let mut cert_reader = io::BufReader::new(std::fs::File::open(cert_path)?);
        let mut key_reader = io::BufReader::new(std::fs::File::open(key_path)?);

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_reader).collect::<std::result::Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(Error::InvalidCertificate);
        }
        let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or(Error::InvalidPrivateKey)?;

        Ok(Self { certs, key })
    }

    /// Build an identity from DER-encoded certificates and key.
    pub fn from_der(certs: Vec<Vec<u8>>, key: Vec<u8>) -> Result<Self> {
        if certs.is_empty() {
            return Err(Error::InvalidCertificate);
        }
        let certs = certs.into_iter().map(CertificateDer::from).collect();
        let key = PrivateKeyDer::try_from(key).map_err(|_| Error::InvalidPrivateKey)?;
        Ok(Self { certs, key })
    }

    /// Generate a throwaway self-signed identity for the given names.
    pub fn self_signed(names: Vec<String>) -> Result<Self> {
        let cert = rcgen::generate_simple_self_signed(names)
            .map_err(|_| Error::InvalidCertificate)?;
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key = PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .map_err(|_| Error::InvalidPrivateKey)?;
        Ok(Self {
            certs: vec![cert_der],
            key,
        })
    }
}

/// Install the ring crypto provider. Safe to call more than once; a second
/// install attempt is ignored.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build the server-side TLS configuration. When `client_roots` is given,
/// handshakes require a client certificate chaining to one of those roots.
pub fn server_config(
    identity: &TlsIdentity,
    client_roots: Option<&[CertificateDer<'static>]>,
) -> Result<Arc<rustls::ServerConfig>> {
    install_crypto_provider();
    let builder =
        rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS12]);

    let config = match client_roots {
        Some(roots_der) => {
            let mut roots = RootCertStore::empty();
            for cert in roots_der {
                roots
                    .add(cert.clone())
                    .map_err(|_| Error::InvalidCertificate)?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|_| Error::InvalidCertificate)?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(identity.certs.clone(), identity.key.clone_key())?
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(identity.certs.clone(), identity.key.clone_key())?,
    };
    Ok(Arc::new(config))
}

/// Build the client-side TLS configuration. The trust store is the webpki
/// root set extended with `extra_roots`; `client_identity` enables client
/// certificate authentication.
pub fn client_config(
    extra_roots: &[CertificateDer<'static>],
    client_identity: Option<&TlsIdentity>,
) -> Result<Arc<rustls::ClientConfig>> {
    install_crypto_provider();
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in extra_roots {
        roots
            .add(cert.clone())
            .map_err(|_| Error::InvalidCertificate)?;
    }

    let builder = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .with_root_certificates(roots);

    let config = match client_identity {
        Some(identity) => {
            builder.with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Load PEM certificates from each path into one DER list.
pub fn load_root_certificates(paths: &[std::path::PathBuf]) -> Result<Vec<CertificateDer<'static>>> {
    let mut out = Vec::new();
    for path in paths {
        let mut reader = io::BufReader::new(std::fs::File::open(path)?);
        for cert in rustls_pemfile::certs(&mut reader) {
            out.push(cert?);
        }
    }
    Ok(out)
}

/// Run the server side of the TLS handshake over an accepted stream.
pub async fn accept(
    config: Arc<rustls::ServerConfig>,
    stream: TcpStream,
) -> Result<tokio_rustls::server::TlsStream<TcpStream>> {
    let acceptor = TlsAcceptor::from(config);
    Ok(acceptor.accept(stream).await?)
}

/// Run the client side of the TLS handshake, verifying `host` against the
/// presented certificate.
pub async fn connect(
    config: Arc<rustls::ClientConfig>,
    host: &str,
    stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = TlsConnector::from(config);
    let name = ServerName::try_from(host)
        .map_err(|_| Error::InvalidDnsName(host.to_string()))?
        .to_owned();
    Ok(connector.connect(name, stream).await?)
}
